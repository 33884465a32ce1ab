//! Loading and validating the daemon's TOML config.

use std::path::Path;

use anyhow::Context;

use fleetgrid_balancer::BalancerConfig;

/// Read, parse, and validate a config file.
pub fn load(path: &Path) -> anyhow::Result<BalancerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse(&content).with_context(|| format!("invalid config {}", path.display()))
}

pub fn parse(content: &str) -> anyhow::Result<BalancerConfig> {
    let config: BalancerConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_autoscale::DrainPolicy;
    use fleetgrid_state::StrategyName;

    #[test]
    fn sample_config_is_valid() {
        let config = parse(include_str!("../fleet.toml")).unwrap();
        assert_eq!(config.strategy.name, StrategyName::LeastConnections);
        assert_eq!(config.autoscaling.min_instances, 2);
        assert_eq!(config.scaler.drain_policy, DrainPolicy::ForceRemove);
        // Seeded backends sit below the scaler's provision range.
        assert_eq!(config.scaler.provision_base_port, 4000);
        assert!(config.instances.iter().all(|i| i.port < 4000));
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.instances[1].max_connections, 200);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, BalancerConfig::default());
    }

    #[test]
    fn validation_errors_surface() {
        let err = parse(
            r#"
[autoscaling]
min_instances = 4
max_instances = 2
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_instances"), "{err}");
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(parse("[strategy]\nname = \"fastest\"\n").is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let path = std::env::temp_dir().join("fleetd-missing-config.toml");
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("fleetd-missing-config.toml"));
    }

    #[test]
    fn load_reads_from_disk() {
        let path = std::env::temp_dir().join(format!("fleetd-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[health]\ninterval_secs = 5\n").unwrap();
        let config = load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.health.interval_secs, 5);
    }
}
