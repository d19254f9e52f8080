//! Process entrypoint CLI (SPEC_FULL.md §6): `--config`/`--host`/`--port`
//! flags with `AIGATEWAY_*` environment fallbacks, mirroring the gateway's
//! own `clap::Parser` + `env = "..."` bootstrap args.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "aigateway", version, about = "Fault-tolerant reverse proxy for OpenAI-compatible LLM upstreams")]
pub struct CliArgs {
    /// Path to the TOML config file.
    #[arg(long, env = "AIGATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind host, overrides the config file.
    #[arg(long, env = "AIGATEWAY_HOST")]
    pub host: Option<String>,

    /// Bind port, overrides the config file.
    #[arg(long, env = "AIGATEWAY_PORT")]
    pub port: Option<u16>,

    /// Comma-separated inbound API keys, overrides the config file.
    #[arg(long, env = "AIGATEWAY_API_KEYS")]
    pub api_keys: Option<String>,
}
