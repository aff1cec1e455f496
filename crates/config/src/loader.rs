use std::{path::Path, sync::OnceLock};

use anyhow::{Context, bail};
use regex::Regex;
use serde::Deserialize;
use toml::Value;

use crate::{Config, DiscoveryMode};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    let mut raw_config: Value = toml::from_str(&content)?;
    expand_env_vars(&mut raw_config)?;

    let config = Config::deserialize(raw_config)?;
    validate(&config)?;

    Ok(config)
}

/// Replaces `{{ env.NAME }}` placeholders in string values with the
/// corresponding environment variable. A placeholder referencing an unset
/// variable is a hard error so misconfigured secrets fail at startup.
fn expand_env_vars(value: &mut Value) -> anyhow::Result<()> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder =
        PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"));

    match value {
        Value::String(s) => {
            if !placeholder.is_match(s) {
                return Ok(());
            }

            let mut out = String::with_capacity(s.len());
            let mut last = 0;

            for captures in placeholder.captures_iter(s) {
                let whole = captures.get(0).expect("capture 0 always present");
                let name = &captures[1];

                let Ok(var) = std::env::var(name) else {
                    bail!("environment variable `{name}` referenced in configuration is not set");
                };

                out.push_str(&s[last..whole.start()]);
                out.push_str(&var);
                last = whole.end();
            }

            out.push_str(&s[last..]);
            *s = out;
        }
        Value::Array(values) => {
            for value in values {
                expand_env_vars(value)?;
            }
        }
        Value::Table(table) => {
            for (_, value) in table.iter_mut() {
                expand_env_vars(value)?;
            }
        }
        _ => {}
    }

    Ok(())
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    match config.cluster.discovery.mode {
        DiscoveryMode::Static => {
            if config.cluster.discovery.static_nodes.is_empty() {
                bail!(
                    "discovery mode is `static` but [[cluster.discovery.static_nodes]] is empty; \
                     at least one worker node is required"
                );
            }

            let mut seen = std::collections::BTreeSet::new();
            for node in &config.cluster.discovery.static_nodes {
                if !seen.insert(node.id.as_str()) {
                    bail!("duplicate node id `{}` in static discovery configuration", node.id);
                }
            }
        }
        DiscoveryMode::DnsSrv => {
            if config.cluster.discovery.dns_srv.is_none() {
                bail!("discovery mode is `dns_srv` but [cluster.discovery.dns_srv] is missing");
            }
        }
        DiscoveryMode::ServiceLabel => {
            if config.cluster.discovery.service_label.is_none() {
                bail!("discovery mode is `service_label` but [cluster.discovery.service_label] is missing");
            }
        }
    }

    let health = &config.cluster.health;

    for (name, rate) in [
        ("degraded_success_rate", health.degraded_success_rate),
        ("unhealthy_success_rate", health.unhealthy_success_rate),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            bail!("cluster.health.{name} must be within [0.0, 1.0], got {rate}");
        }
    }

    if health.unhealthy_success_rate > health.degraded_success_rate {
        bail!(
            "cluster.health.unhealthy_success_rate ({}) must not exceed degraded_success_rate ({})",
            health.unhealthy_success_rate,
            health.degraded_success_rate
        );
    }

    if health.success_threshold == 0 {
        bail!("cluster.health.success_threshold must be at least 1");
    }

    if health.backoff.multiplier < 1.0 {
        bail!("cluster.health.backoff.multiplier must be at least 1.0");
    }

    if config.cluster.cache.warmup.concurrency == 0 {
        bail!("cluster.cache.warmup.concurrency must be at least 1");
    }

    if config.llm.retry.max_attempts == 0 {
        bail!("llm.retry.max_attempts must be at least 1");
    }

    if let Some(file) = &config.cluster.cache.system_prompt_file
        && !file.exists()
    {
        bail!("cluster.cache.system_prompt_file does not exist: {}", file.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use toml::Value;

    use crate::Config;

    fn parse(content: &str) -> anyhow::Result<Config> {
        let mut raw: Value = toml::from_str(content)?;
        super::expand_env_vars(&mut raw)?;
        let config = Config::deserialize(raw)?;
        super::validate(&config)?;
        Ok(config)
    }

    #[test]
    fn env_placeholders_are_expanded() {
        temp_env::with_var("HIVE_TEST_NODE_KEY", Some("sk-local-123"), || {
            let config = parse(indoc::indoc! {r#"
                [llm]
                api_key = "{{ env.HIVE_TEST_NODE_KEY }}"

                [[cluster.discovery.static_nodes]]
                id = "w0"
                url = "http://127.0.0.1:9000"
            "#})
            .unwrap();

            use secrecy::ExposeSecret;
            assert_eq!(config.llm.api_key.unwrap().expose_secret(), "sk-local-123");
        });
    }

    #[test]
    fn unset_env_placeholder_fails() {
        temp_env::with_var_unset("HIVE_TEST_MISSING", || {
            let error = parse(indoc::indoc! {r#"
                [llm]
                api_key = "{{ env.HIVE_TEST_MISSING }}"
            "#})
            .unwrap_err();

            assert!(error.to_string().contains("HIVE_TEST_MISSING"));
        });
    }

    #[test]
    fn static_mode_requires_nodes() {
        let error = parse("").unwrap_err();
        assert!(error.to_string().contains("static_nodes"));
    }

    #[test]
    fn duplicate_static_node_ids_rejected() {
        let error = parse(indoc::indoc! {r#"
            [[cluster.discovery.static_nodes]]
            id = "w0"
            url = "http://127.0.0.1:9000"

            [[cluster.discovery.static_nodes]]
            id = "w0"
            url = "http://127.0.0.1:9001"
        "#})
        .unwrap_err();

        assert!(error.to_string().contains("duplicate node id"));
    }

    #[test]
    fn dns_mode_requires_parameters() {
        let error = parse(indoc::indoc! {r#"
            [cluster.discovery]
            mode = "dns_srv"
        "#})
        .unwrap_err();

        assert!(error.to_string().contains("dns_srv"));
    }

    #[test]
    fn success_rate_bounds_are_checked() {
        let error = parse(indoc::indoc! {r#"
            [[cluster.discovery.static_nodes]]
            id = "w0"
            url = "http://127.0.0.1:9000"

            [cluster.health]
            degraded_success_rate = 1.5
        "#})
        .unwrap_err();

        assert!(error.to_string().contains("degraded_success_rate"));
    }
}
