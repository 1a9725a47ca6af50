//! Tests for the upstream-guard-cli library module.

use super::*;
use std::io::Write as _;

fn yaml_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

fn options(requests: u32) -> SimulationOptions {
    SimulationOptions {
        service: ServiceName::weather(),
        caller: CallerId::new("alice").unwrap(),
        plan: PlanTier::Free,
        requests,
        fail_first: 0,
        fail_status: 503,
        params: NormalizedParams::from([("city", "oslo")]),
        unique: false,
    }
}

mod cli_parsing_tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::try_parse_from(["upstream-guard", "simulate"]).unwrap();

        match cli.command {
            Commands::Simulate {
                service,
                user,
                plan,
                requests,
                fail_first,
                fail_status,
                params,
                unique,
                format,
            } => {
                assert_eq!(service, "weather");
                assert_eq!(user, "demo-user");
                assert_eq!(plan, "FREE");
                assert_eq!(requests, 12);
                assert_eq!(fail_first, 0);
                assert_eq!(fail_status, 503);
                assert!(params.is_empty());
                assert!(!unique);
                assert_eq!(format, OutputFormat::Text);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_repeated_params_and_global_flags() {
        let cli = Cli::try_parse_from([
            "upstream-guard",
            "--json-logs",
            "--log-level",
            "debug",
            "simulate",
            "--param",
            "city=oslo",
            "--param",
            "units=metric",
            "-f",
            "json",
        ])
        .unwrap();

        assert!(cli.json_logs);
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Simulate { params, format, .. } => {
                assert_eq!(params, vec!["city=oslo", "units=metric"]);
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_usage_requires_user() {
        assert!(Cli::try_parse_from(["upstream-guard", "usage"]).is_err());

        let cli = Cli::try_parse_from([
            "upstream-guard",
            "usage",
            "--user",
            "bob",
            "--service",
            "news",
        ])
        .unwrap();
        match cli.command {
            Commands::Usage { user, services, .. } => {
                assert_eq!(user, "bob");
                assert_eq!(services, vec!["news"]);
            }
            _ => panic!("Expected Usage command"),
        }
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let result = Cli::try_parse_from(["upstream-guard", "config", "-f", "ini"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            CliError::Configuration(ConfigError::RedisUnsupported).exit_code(),
            invalid_argument("x", "y").exit_code(),
            CliError::Store(CounterStoreError::Unavailable {
                message: "down".to_string(),
            })
            .exit_code(),
            output_error("bad").exit_code(),
        ];

        let mut unique = codes.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }
}

mod parse_params_tests {
    use super::*;

    #[test]
    fn test_pairs_are_normalized() {
        let params = parse_params(&["b=2".to_string(), "a=1".to_string()]).unwrap();

        assert_eq!(params, NormalizedParams::from([("a", "1"), ("b", "2")]));
    }

    #[test]
    fn test_value_may_contain_equals_sign() {
        let params = parse_params(&["q=a=b".to_string()]).unwrap();
        assert_eq!(params.get("q"), Some("a=b"));
    }

    #[test]
    fn test_malformed_pair_is_rejected() {
        for raw in ["noequals", "=value"] {
            let result = parse_params(&[raw.to_string()]);
            assert!(
                matches!(result, Err(CliError::InvalidArgument { ref arg, .. }) if arg == "param"),
                "expected rejection of {raw}"
            );
        }
    }
}

mod configuration_tests {
    use super::*;

    #[test]
    fn test_missing_explicit_file() {
        let result = load_configuration(Some(Path::new("/nonexistent/upstream-guard.yaml")));
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let file = yaml_config(
            r#"
rate_limit:
  free_limit: 3
cache:
  default_ttl_seconds: 60
  service_ttl_seconds:
    crypto: 15
"#,
        );

        let config = load_configuration(Some(file.path())).unwrap();

        assert_eq!(config.rate_limit.free_limit, 3);
        assert_eq!(config.rate_limit.pro_limit, 100);
        assert_eq!(config.cache.ttl_for(&ServiceName::crypto()).as_secs(), 15);
        assert_eq!(config.cache.ttl_for(&ServiceName::news()).as_secs(), 60);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let file = yaml_config(
            r#"
rate_limit:
  window_seconds: 0
"#,
        );

        let result = load_configuration(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_file_fails_to_load() {
        let file = yaml_config("rate_limit: [this is not a map");

        let result = load_configuration(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_config_command_shows_resolved_configuration() {
        let file = yaml_config("rate_limit:\n  pro_limit: 250\n");

        for format in [ConfigFormat::Yaml, ConfigFormat::Json, ConfigFormat::Toml] {
            let mut out = Vec::new();
            execute_config_command(Some(file.path()), true, format.clone(), &mut out).unwrap();

            let rendered = String::from_utf8(out).unwrap();
            assert!(rendered.contains("pro_limit"), "{format:?}: {rendered}");
            assert!(rendered.contains("250"), "{format:?}: {rendered}");
        }
    }

    #[test]
    fn test_config_command_without_show() {
        let file = yaml_config("{}\n");
        let mut out = Vec::new();

        execute_config_command(Some(file.path()), false, ConfigFormat::Yaml, &mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Configuration is valid\n");
    }

    #[tokio::test]
    async fn test_in_memory_store_without_url() {
        let config = GuardConfig::default();
        assert!(build_store(&config).await.is_ok());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_store_url_requires_redis_support() {
        let config = GuardConfig {
            counter_store_url: Some("redis://localhost:6379".to_string()),
            ..GuardConfig::default()
        };

        let result = build_store(&config).await;
        assert!(matches!(
            result,
            Err(CliError::Configuration(ConfigError::RedisUnsupported))
        ));
    }
}

mod simulation_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_params_are_served_from_cache() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());

        let report = run_simulation(store, GuardConfig::default(), options(12))
            .await
            .unwrap();

        assert_eq!(report.upstream_fetches, 1);
        assert_eq!(report.records[0].outcome, "fetched");
        assert_eq!(report.records[0].used, Some(1));
        assert!(report.records[1..].iter().all(|r| r.cached));
        assert_eq!(report.cache.hits, 11);
    }

    #[tokio::test]
    async fn test_unique_params_hit_the_free_quota() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let options = SimulationOptions {
            unique: true,
            ..options(12)
        };

        let report = run_simulation(store, GuardConfig::default(), options)
            .await
            .unwrap();

        assert_eq!(report.upstream_fetches, 10);
        let limited: Vec<_> = report
            .records
            .iter()
            .filter(|r| r.outcome == "rate_limited")
            .collect();
        assert_eq!(limited.len(), 2);
        assert!(limited
            .iter()
            .all(|r| r.used == Some(10) && r.limit == Some(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let options = SimulationOptions {
            fail_first: 3,
            unique: true,
            ..options(2)
        };

        let report = run_simulation(store, GuardConfig::default(), options)
            .await
            .unwrap();

        assert_eq!(report.upstream_fetches, 4);
        assert_eq!(report.records[0].outcome, "upstream_transient");
        assert_eq!(report.records[1].outcome, "fetched");
        assert_eq!(report.status.metrics.failed_requests, 1);
        assert_eq!(report.status.metrics.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let options = SimulationOptions {
            fail_first: 1,
            fail_status: 404,
            ..options(1)
        };

        let report = run_simulation(store, GuardConfig::default(), options)
            .await
            .unwrap();

        assert_eq!(report.upstream_fetches, 1);
        assert_eq!(report.records[0].outcome, "upstream_client");
        assert!(report.records[0].message.is_some());
    }

    #[tokio::test]
    async fn test_text_and_json_rendering() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let report = run_simulation(store, GuardConfig::default(), options(2))
            .await
            .unwrap();

        let mut text = Vec::new();
        render(&report, &OutputFormat::Text, &mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("fetched"));
        assert!(text.contains("Upstream fetches: 1"));

        let mut json = Vec::new();
        render(&report, &OutputFormat::Json, &mut json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["upstream_fetches"], 1);
        assert_eq!(value["records"][1]["outcome"], "cached");
    }
}

mod usage_tests {
    use super::*;

    #[tokio::test]
    async fn test_usage_after_simulation() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let options = SimulationOptions {
            unique: true,
            ..options(12)
        };
        run_simulation(Arc::clone(&store), GuardConfig::default(), options)
            .await
            .unwrap();

        let report = collect_usage(
            store,
            GuardConfig::default(),
            &CallerId::new("alice").unwrap(),
            PlanTier::Free,
            &ServiceName::well_known(),
        )
        .await
        .unwrap();

        let weather = &report.services[0];
        assert_eq!(weather.service, "weather");
        assert_eq!(weather.current, 10);
        assert_eq!(weather.remaining, 0);
        assert_eq!(weather.status, upstream_guard_core::UsageStatus::Limited);

        let news = &report.services[1];
        assert_eq!(news.current, 0);
        assert_eq!(news.remaining, 10);

        let analytics = &report.analytics["weather"];
        assert_eq!(analytics.total_requests, 12);
        assert!(!report.analytics.contains_key("news"));
    }

    #[tokio::test]
    async fn test_usage_text_rendering() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let report = collect_usage(
            store,
            GuardConfig::default(),
            &CallerId::new("carol").unwrap(),
            PlanTier::Pro,
            &[ServiceName::crypto()],
        )
        .await
        .unwrap();

        let mut out = Vec::new();
        render(&report, &OutputFormat::Text, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("Caller carol on the PRO plan"));
        assert!(text.contains("crypto"));
        assert!(text.contains("100"));
    }

    /// Without a shared store the command can only see its own empty store.
    #[tokio::test]
    async fn test_usage_without_shared_store_says_so() {
        let file = yaml_config("rate_limit:\n  free_limit: 10\n");
        let path = file.path().to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "upstream-guard",
            "--config",
            path.as_str(),
            "usage",
            "--user",
            "dana",
            "--format",
            "json",
        ])
        .unwrap();

        let mut out = Vec::new();
        run_command(cli, &mut out).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["shared_store"], false);

        let report = collect_usage(
            Arc::new(InMemoryCounterStore::new()),
            GuardConfig::default(),
            &CallerId::new("dana").unwrap(),
            PlanTier::Free,
            &[ServiceName::weather()],
        )
        .await
        .unwrap();
        let mut out = Vec::new();
        render(&report, &OutputFormat::Text, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("no counter_store_url configured"));
    }

    #[tokio::test]
    async fn test_usage_with_shared_store_has_no_note() {
        let config = GuardConfig {
            counter_store_url: Some("redis://127.0.0.1:6379".to_string()),
            ..GuardConfig::default()
        };
        let report = collect_usage(
            Arc::new(InMemoryCounterStore::new()),
            config,
            &CallerId::new("dana").unwrap(),
            PlanTier::Free,
            &[ServiceName::weather()],
        )
        .await
        .unwrap();

        assert!(report.shared_store);
        let mut out = Vec::new();
        render(&report, &OutputFormat::Text, &mut out).unwrap();
        assert!(!String::from_utf8(out).unwrap().contains("Note:"));
    }
}
