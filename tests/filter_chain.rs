//! End-to-end filter-chain selection scenarios.
//!
//! Exercises the public engine API the way an embedding listener would:
//! build a generation from configuration, dispatch connections against it,
//! reload, and observe draining.

use std::sync::Arc;

use conn_dispatch::filter_chain::{FilterChainConfig, FilterChainEngine, FilterChainMatch};
use conn_dispatch::net::socket::{ConnectionSocket, SourceType};
use conn_dispatch::FilterChainError;

fn chain(name: &str, m: FilterChainMatch) -> FilterChainConfig {
    FilterChainConfig {
        name: name.into(),
        filter_chain_match: m,
        ..FilterChainConfig::default()
    }
}

fn socket(dest: &str, remote: &str) -> ConnectionSocket {
    ConnectionSocket::new(dest.parse().unwrap(), remote.parse().unwrap())
}

#[test]
fn exact_sni_wins_over_wildcard() {
    let engine = FilterChainEngine::new(
        &[
            chain(
                "exact",
                FilterChainMatch {
                    server_names: vec!["foo.example.com".into()],
                    ..FilterChainMatch::default()
                },
            ),
            chain(
                "wildcard",
                FilterChainMatch {
                    server_names: vec!["*.example.com".into()],
                    ..FilterChainMatch::default()
                },
            ),
        ],
        None,
        None,
    )
    .unwrap();

    let s = socket("10.0.0.1:443", "203.0.113.9:40000").with_server_name("foo.example.com");
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "exact");

    let s = socket("10.0.0.1:443", "203.0.113.9:40000").with_server_name("bar.example.com");
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "wildcard");
}

#[test]
fn destination_ip_longest_prefix_tie_break() {
    let engine = FilterChainEngine::new(
        &[
            chain(
                "wide",
                FilterChainMatch {
                    destination_ranges: vec!["10.0.0.0/8".into()],
                    ..FilterChainMatch::default()
                },
            ),
            chain(
                "narrow",
                FilterChainMatch {
                    destination_ranges: vec!["10.1.2.0/24".into()],
                    ..FilterChainMatch::default()
                },
            ),
        ],
        None,
        None,
    )
    .unwrap();

    let s = socket("10.1.2.5:443", "203.0.113.9:40000");
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "narrow");

    let s = socket("10.2.0.1:443", "203.0.113.9:40000");
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "wide");
}

#[test]
fn source_type_isolation() {
    let engine = FilterChainEngine::new(
        &[
            chain(
                "local",
                FilterChainMatch {
                    source_type: SourceType::Local,
                    ..FilterChainMatch::default()
                },
            ),
            chain(
                "external",
                FilterChainMatch {
                    source_type: SourceType::External,
                    ..FilterChainMatch::default()
                },
            ),
        ],
        None,
        None,
    )
    .unwrap();

    let s = socket("10.0.0.1:443", "127.0.0.1:40000");
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "local");

    let s = socket("10.0.0.1:443", "203.0.113.9:40000");
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "external");
}

#[test]
fn duplicate_matcher_rejected_and_previous_generation_survives() {
    let original = vec![chain(
        "https",
        FilterChainMatch {
            destination_port: Some(443),
            ..FilterChainMatch::default()
        },
    )];
    let engine = FilterChainEngine::new(&original, None, None).unwrap();

    let dup_match = FilterChainMatch {
        destination_port: Some(443),
        server_names: vec!["a".into()],
        ..FilterChainMatch::default()
    };
    let err = engine
        .reload(
            &[chain("one", dup_match.clone()), chain("two", dup_match)],
            None,
            None,
        )
        .unwrap_err();
    match err {
        FilterChainError::DuplicateMatcher { first, second } => {
            assert_eq!(first, "one");
            assert_eq!(second, "two");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The previously published generation is still serving.
    let s = socket("10.0.0.1:443", "203.0.113.9:40000");
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "https");
}

#[test]
fn lookup_only_returns_configured_chains_or_default() {
    let configured = vec![
        chain(
            "a",
            FilterChainMatch {
                server_names: vec!["a.example.com".into()],
                ..FilterChainMatch::default()
            },
        ),
        chain(
            "b",
            FilterChainMatch {
                destination_port: Some(8443),
                ..FilterChainMatch::default()
            },
        ),
    ];
    let default = chain("default", FilterChainMatch::default());
    let engine = FilterChainEngine::new(&configured, Some(&default), None).unwrap();

    let known: Vec<String> = configured
        .iter()
        .map(|c| c.name.clone())
        .chain(std::iter::once(default.name.clone()))
        .collect();

    let probes = [
        socket("10.0.0.1:443", "203.0.113.9:40000").with_server_name("a.example.com"),
        socket("10.0.0.1:8443", "203.0.113.9:40000"),
        socket("192.168.7.7:9999", "198.51.100.3:1234").with_server_name("z.example.org"),
        socket("10.0.0.1:443", "127.0.0.1:2"),
    ];
    for probe in probes {
        let found = engine.find_filter_chain(&probe).unwrap();
        assert!(known.contains(&found.name().to_string()));
    }
}

#[test]
fn building_the_same_configuration_twice_is_equivalent() {
    let configs = vec![
        chain(
            "sni",
            FilterChainMatch {
                server_names: vec!["*.example.com".into()],
                transport_protocol: "tls".into(),
                ..FilterChainMatch::default()
            },
        ),
        chain(
            "cidr",
            FilterChainMatch {
                destination_ranges: vec!["10.0.0.0/8".into(), "192.168.0.0/16".into()],
                ..FilterChainMatch::default()
            },
        ),
        chain(
            "ports",
            FilterChainMatch {
                destination_port: Some(9000),
                source_ports: vec![1000, 2000],
                ..FilterChainMatch::default()
            },
        ),
    ];
    let first = FilterChainEngine::new(&configs, None, None).unwrap();
    let second = FilterChainEngine::new(&configs, None, None).unwrap();

    let probes = [
        socket("10.3.4.5:443", "203.0.113.9:40000")
            .with_server_name("x.example.com")
            .with_transport_protocol("tls"),
        socket("192.168.1.1:80", "203.0.113.9:40000"),
        socket("172.16.0.1:9000", "203.0.113.9:1000"),
        socket("172.16.0.1:9000", "203.0.113.9:3000"),
        socket("172.16.0.1:1234", "203.0.113.9:40000"),
    ];
    for probe in probes {
        let a = first.find_filter_chain(&probe).map(|c| c.name().to_string());
        let b = second.find_filter_chain(&probe).map(|c| c.name().to_string());
        assert_eq!(a, b);
    }
}

#[test]
fn identical_reload_reuses_every_chain_object() {
    let configs = vec![
        chain(
            "a",
            FilterChainMatch {
                server_names: vec!["a.example.com".into()],
                ..FilterChainMatch::default()
            },
        ),
        chain(
            "b",
            FilterChainMatch {
                destination_port: Some(8443),
                ..FilterChainMatch::default()
            },
        ),
    ];
    let default = chain("default", FilterChainMatch::default());
    let engine = FilterChainEngine::new(&configs, Some(&default), None).unwrap();

    let before_a = engine
        .find_filter_chain(
            &socket("10.0.0.1:443", "203.0.113.9:40000").with_server_name("a.example.com"),
        )
        .unwrap();
    let before_default = engine
        .find_filter_chain(&socket("10.0.0.1:80", "203.0.113.9:40000"))
        .unwrap();

    engine.reload(&configs, Some(&default), None).unwrap();

    let after_a = engine
        .find_filter_chain(
            &socket("10.0.0.1:443", "203.0.113.9:40000").with_server_name("a.example.com"),
        )
        .unwrap();
    let after_default = engine
        .find_filter_chain(&socket("10.0.0.1:80", "203.0.113.9:40000"))
        .unwrap();

    assert!(Arc::ptr_eq(&before_a, &after_a));
    assert!(Arc::ptr_eq(&before_default, &after_default));
    assert!(engine.draining_filter_chains().is_empty());
}

#[test]
fn displaced_chains_drain_while_connections_hold_them() {
    let engine = FilterChainEngine::new(
        &[chain(
            "old",
            FilterChainMatch {
                destination_port: Some(443),
                ..FilterChainMatch::default()
            },
        )],
        None,
        None,
    )
    .unwrap();

    let held = engine
        .find_filter_chain(&socket("10.0.0.1:443", "203.0.113.9:40000"))
        .unwrap();

    engine
        .reload(
            &[chain(
                "new",
                FilterChainMatch {
                    destination_port: Some(8443),
                    ..FilterChainMatch::default()
                },
            )],
            None,
            None,
        )
        .unwrap();

    // The displaced chain is draining but alive while the connection holds it.
    assert!(held.drain_close());
    assert_eq!(engine.draining_filter_chains().len(), 1);
    assert_eq!(engine.prune_drained(), 0);
    drop(held);
    assert_eq!(engine.prune_drained(), 1);
}

#[test]
fn alpn_offer_order_breaks_ties() {
    let engine = FilterChainEngine::new(
        &[
            chain(
                "h2",
                FilterChainMatch {
                    application_protocols: vec!["h2".into()],
                    ..FilterChainMatch::default()
                },
            ),
            chain(
                "h1",
                FilterChainMatch {
                    application_protocols: vec!["http/1.1".into()],
                    ..FilterChainMatch::default()
                },
            ),
        ],
        None,
        None,
    )
    .unwrap();

    let s = socket("10.0.0.1:443", "203.0.113.9:40000")
        .with_application_protocols(vec!["http/1.1".into(), "h2".into()]);
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "h1");

    let s = socket("10.0.0.1:443", "203.0.113.9:40000")
        .with_application_protocols(vec!["h2".into(), "http/1.1".into()]);
    assert_eq!(engine.find_filter_chain(&s).unwrap().name(), "h2");
}
