use anyhow::bail;
use clap::{Parser, ValueEnum};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio::sync::Semaphore;

/// Runtime configuration for the `piper-gateway-server` binary.
///
/// Every setting can be given as a CLI flag or an environment variable (a
/// `.env` file in the working directory is loaded first). The defaults match
/// the conventional `piper_total/` deployment layout next to the binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "piper-gateway-server",
    version,
    about = "An HTTP service that synthesizes speech with Piper"
)]
pub struct CliArgs {
    /// Interface to bind.
    ///
    /// Environment variable: `HOST`
    #[arg(long, env = "HOST", default_value_t = String::from("0.0.0.0"))]
    pub host: String,

    /// TCP port to listen on.
    ///
    /// Environment variable: `PORT`
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Deployment environment label. Informational only; it is logged at
    /// startup and has no effect on behavior.
    ///
    /// Environment variable: `APP_ENV`
    #[arg(long, env = "APP_ENV", default_value_t = String::from("development"))]
    pub environment: String,

    /// Path to the Piper executable.
    ///
    /// Environment variable: `PIPER_BIN`
    #[arg(long, env = "PIPER_BIN", default_value = "./piper_total/piper_new")]
    pub piper_bin: PathBuf,

    /// Path to the ONNX voice model passed with `-m`.
    ///
    /// Environment variable: `PIPER_MODEL`
    #[arg(
        long,
        env = "PIPER_MODEL",
        default_value = "./piper_total/en_US-lessac-medium.onnx"
    )]
    pub model: PathBuf,

    /// espeak-ng data directory passed with `--espeak_data`.
    ///
    /// Environment variable: `PIPER_ESPEAK_DATA`
    #[arg(
        long,
        env = "PIPER_ESPEAK_DATA",
        default_value = "./piper_total/piper/espeak-ng-data"
    )]
    pub espeak_data: PathBuf,

    /// Directory holding Piper's shared libraries. It is prepended to the
    /// dynamic linker search path of every spawned process.
    ///
    /// Environment variable: `PIPER_LIBRARY_PATH`
    #[arg(long, env = "PIPER_LIBRARY_PATH", default_value = "./piper_total/piper")]
    pub library_path: PathBuf,

    /// Seconds of silence inserted between sentences.
    ///
    /// Environment variable: `PIPER_SENTENCE_SILENCE`
    #[arg(long, env = "PIPER_SENTENCE_SILENCE", default_value_t = 0.5)]
    pub sentence_silence: f64,

    /// Additional fixed arguments appended to every Piper invocation.
    ///
    /// Environment variable: `PIPER_EXTRA_ARGS` (comma separated)
    #[arg(
        long = "extra-arg",
        env = "PIPER_EXTRA_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    pub extra_args: Vec<String>,

    /// Directory for transient per-request output files. Created if absent.
    ///
    /// Environment variable: `OUTPUT_DIR`
    #[arg(long, env = "OUTPUT_DIR", default_value = "./temp")]
    pub output_dir: PathBuf,

    /// Upper bound on a single Piper run, after which the process is killed.
    /// `0` lets processes run for as long as they need.
    ///
    /// Environment variable: `SYNTHESIS_TIMEOUT_SECS`
    #[arg(long, env = "SYNTHESIS_TIMEOUT_SECS", default_value_t = 120)]
    pub synthesis_timeout_secs: u64,

    /// Maximum number of Piper processes running at once. Requests beyond
    /// the bound wait for a slot. `0` means unbounded.
    ///
    /// Environment variable: `MAX_CONCURRENT_SYNTHESES`
    #[arg(long, env = "MAX_CONCURRENT_SYNTHESES", default_value_t = 0)]
    pub max_concurrent_syntheses: usize,

    /// Console log format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Everything the synthesis pipeline needs, fixed for the life of the
/// process and shared read-only by all requests.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub piper_bin: PathBuf,
    pub model: PathBuf,
    pub espeak_data: PathBuf,
    pub library_path: PathBuf,
    pub sentence_silence: f64,
    pub extra_args: Vec<String>,
    pub output_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub environment: String,
    pub log_format: LogFormat,
    pub synthesis: SynthesisConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.port == 0 {
            bail!("PORT must be greater than 0");
        }

        if !args.sentence_silence.is_finite() || args.sentence_silence < 0.0 {
            bail!(
                "PIPER_SENTENCE_SILENCE must be a non-negative number (got {})",
                args.sentence_silence
            );
        }

        if args.max_concurrent_syntheses > Semaphore::MAX_PERMITS {
            bail!(
                "MAX_CONCURRENT_SYNTHESES must be at most {} (got {})",
                Semaphore::MAX_PERMITS,
                args.max_concurrent_syntheses
            );
        }

        // Bare IPv6 literals need brackets; hostnames like `localhost` are
        // left to the resolver at bind time.
        let listen_addr = if args.host.contains(':') && !args.host.starts_with('[') {
            listen_addr_as_v6(&args.host, args.port)?.to_string()
        } else {
            format!("{}:{}", args.host, args.port)
        };

        let extra_args = args
            .extra_args
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        Ok(Self {
            listen_addr,
            environment: args.environment,
            log_format: args.log_format,
            synthesis: SynthesisConfig {
                piper_bin: args.piper_bin,
                model: args.model,
                espeak_data: args.espeak_data,
                library_path: args.library_path,
                sentence_silence: args.sentence_silence,
                extra_args,
                output_dir: args.output_dir,
                timeout: (args.synthesis_timeout_secs > 0)
                    .then(|| Duration::from_secs(args.synthesis_timeout_secs)),
                max_concurrent: (args.max_concurrent_syntheses > 0)
                    .then_some(args.max_concurrent_syntheses),
            },
        })
    }
}

fn listen_addr_as_v6(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    match format!("[{host}]:{port}").parse() {
        Ok(addr) => Ok(addr),
        Err(e) => bail!("HOST {host:?} is not a valid address: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let mut argv = vec!["piper-gateway-server"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_follow_the_piper_total_layout() {
        let config = ServerConfig::try_from(parse(&[
            "--host",
            "0.0.0.0",
            "--port",
            "5000",
            "--piper-bin",
            "./piper_total/piper_new",
            "--sentence-silence",
            "0.5",
            "--synthesis-timeout-secs",
            "120",
            "--max-concurrent-syntheses",
            "0",
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:5000");
        assert_eq!(
            config.synthesis.piper_bin,
            PathBuf::from("./piper_total/piper_new")
        );
        assert_eq!(config.synthesis.sentence_silence, 0.5);
        assert_eq!(config.synthesis.timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.synthesis.max_concurrent, None);
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config =
            ServerConfig::try_from(parse(&["--synthesis-timeout-secs", "0", "--port", "8080"]))
                .unwrap();
        assert_eq!(config.synthesis.timeout, None);
    }

    #[test]
    fn extra_args_split_on_commas() {
        let config = ServerConfig::try_from(parse(&[
            "--port",
            "8080",
            "--extra-arg=--length_scale, 1.1,,--noise_scale",
        ]))
        .unwrap();
        assert_eq!(
            config.synthesis.extra_args,
            vec!["--length_scale", "1.1", "--noise_scale"]
        );
    }

    #[test]
    fn rejects_negative_silence() {
        let err = ServerConfig::try_from(parse(&["--port", "8080", "--sentence-silence=-1"]))
            .unwrap_err();
        assert!(err.to_string().contains("PIPER_SENTENCE_SILENCE"));
    }

    #[test]
    fn rejects_port_zero() {
        assert!(ServerConfig::try_from(parse(&["--port", "0"])).is_err());
    }

    #[test]
    fn rejects_oversized_concurrency_bound() {
        let too_many = usize::MAX.to_string();
        let err = ServerConfig::try_from(parse(&["--max-concurrent-syntheses", &too_many]))
            .unwrap_err();
        assert!(err.to_string().contains("MAX_CONCURRENT_SYNTHESES"));
    }

    #[test]
    fn brackets_bare_ipv6_hosts() {
        let config = ServerConfig::try_from(parse(&["--host", "::", "--port", "8080"])).unwrap();
        assert_eq!(config.listen_addr, "[::]:8080");
    }
}
