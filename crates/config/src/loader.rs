use std::path::Path;

use anyhow::{Context, bail};
use secrecy::SecretString;

use crate::{BackendKind, Config, DiscoverySource};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "CROSSBAR_";

pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))?;

    apply_env_overrides(&mut config)?;
    validate(&config)?;

    Ok(config)
}

/// Apply `CROSSBAR_*` environment overrides. Environment always wins over the
/// file, which wins over built-in defaults.
pub(crate) fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Some(kind) = env_var("BACKEND") {
        config.backend.kind = parse_backend_kind(&kind)?;
    }

    if let Some(url) = env_var("BACKEND_URL") {
        config.backend.url = Some(url);
    }

    if let Some(key) = env_var("BACKEND_API_KEY") {
        config.backend.api_key = Some(SecretString::from(key));
    }

    if let Some(model) = env_var("BACKEND_MODEL") {
        config.backend.model = Some(model);
    }

    if let Some(listen) = env_var("LISTEN_ADDRESS") {
        config.server.listen_address = Some(
            listen
                .parse()
                .with_context(|| format!("invalid {ENV_PREFIX}LISTEN_ADDRESS '{listen}'"))?,
        );
    }

    if let Some(truncate) = env_var("TRUNCATE_SYSTEM_PROMPT") {
        config.backend.truncate_system_prompt = parse_bool("TRUNCATE_SYSTEM_PROMPT", &truncate)?;
    }

    if let Some(max_tokens) = env_var("SYSTEM_PROMPT_MAX_TOKENS") {
        config.backend.system_prompt_max_tokens = max_tokens
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}SYSTEM_PROMPT_MAX_TOKENS '{max_tokens}'"))?;
    }

    if let Some(inject) = env_var("INJECT_TOOL_INSTRUCTIONS") {
        config.backend.inject_tool_instructions = parse_bool("INJECT_TOOL_INSTRUCTIONS", &inject)?;
    }

    if let Some(level) = env_var("DEBUG_LEVEL") {
        config.debug_level = level
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}DEBUG_LEVEL '{level}'"))?;
    }

    Ok(())
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.debug_level > 3 {
        bail!("debug_level must be between 0 and 3, got {}", config.debug_level);
    }

    let threshold = config.backend.injection_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        bail!("injection_threshold must be within [0, 1], got {threshold}");
    }

    if config.backend.kind.is_cluster()
        && let DiscoverySource::Static { nodes } = &config.cluster.discovery.source
        && nodes.is_empty()
    {
        bail!(
            "backend 'mlx-cluster' requires cluster nodes: list them under \
            [cluster.discovery.source] or configure a dns/orchestrator source"
        );
    }

    if config.backend.kind == BackendKind::Openrouter && config.backend.api_key.is_none() {
        log::warn!("backend 'openrouter' has no api_key configured; requests will likely be rejected upstream");
    }

    Ok(())
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok().filter(|v| !v.is_empty())
}

fn parse_backend_kind(value: &str) -> anyhow::Result<BackendKind> {
    match value {
        "claude" => Ok(BackendKind::Claude),
        "local" => Ok(BackendKind::Local),
        "openrouter" => Ok(BackendKind::Openrouter),
        "mlx-cluster" => Ok(BackendKind::MlxCluster),
        other => bail!("unknown backend '{other}', expected one of: claude, local, openrouter, mlx-cluster"),
    }
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => bail!("invalid {ENV_PREFIX}{name} '{other}', expected a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use std::io::Write;

    use crate::{BackendKind, Config};

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_file_values() {
        let file = write_config(indoc! {r#"
            debug_level = 2

            [backend]
            kind = "openrouter"
            url = "https://openrouter.ai/api/v1"
            api_key = "sk-or-123"
            model = "qwen/qwen-2.5-coder-32b-instruct"
        "#});

        let config = temp_env::with_vars_unset(["CROSSBAR_BACKEND", "CROSSBAR_BACKEND_URL"], || {
            Config::load(file.path()).unwrap()
        });

        assert_eq!(config.backend.kind, BackendKind::Openrouter);
        assert_eq!(config.backend.url.as_deref(), Some("https://openrouter.ai/api/v1"));
        assert_eq!(config.debug_level, 2);
    }

    #[test]
    fn environment_wins_over_file() {
        let file = write_config(indoc! {r#"
            [backend]
            kind = "local"
            model = "file-model"
        "#});

        let config = temp_env::with_vars(
            [
                ("CROSSBAR_BACKEND", Some("claude")),
                ("CROSSBAR_BACKEND_MODEL", Some("claude-sonnet-4")),
                ("CROSSBAR_DEBUG_LEVEL", Some("1")),
            ],
            || Config::load(file.path()).unwrap(),
        );

        assert_eq!(config.backend.kind, BackendKind::Claude);
        assert_eq!(config.backend.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(config.debug_level, 1);
    }

    #[test]
    fn unknown_env_backend_fails() {
        let file = write_config("");

        let result = temp_env::with_var("CROSSBAR_BACKEND", Some("bedrock"), || Config::load(file.path()));

        let error = result.unwrap_err().to_string();
        assert!(error.contains("unknown backend 'bedrock'"));
    }

    #[test]
    fn cluster_backend_requires_nodes() {
        let file = write_config(indoc! {r#"
            [backend]
            kind = "mlx-cluster"
        "#});

        let result = temp_env::with_var_unset("CROSSBAR_BACKEND", || Config::load(file.path()));

        let error = result.unwrap_err().to_string();
        assert!(error.contains("requires cluster nodes"));
    }

    #[test]
    fn cluster_backend_with_static_nodes_passes() {
        let file = write_config(indoc! {r#"
            [backend]
            kind = "mlx-cluster"

            [cluster.discovery.source]
            type = "static"
            nodes = [{ id = "node-0", url = "http://10.0.0.10:8080/" }]
        "#});

        let config = temp_env::with_var_unset("CROSSBAR_BACKEND", || Config::load(file.path()).unwrap());
        assert!(config.backend.kind.is_cluster());
    }

    #[test]
    fn out_of_range_debug_level_fails() {
        let file = write_config("debug_level = 9");

        let result = temp_env::with_var_unset("CROSSBAR_DEBUG_LEVEL", || Config::load(file.path()));

        let error = result.unwrap_err().to_string();
        assert!(error.contains("debug_level must be between 0 and 3"));
    }
}
