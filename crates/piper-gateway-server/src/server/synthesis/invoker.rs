//! Drives one Piper run for one workspace.
//!
//! [`ProcessInvoker`] turns the shared [`SynthesisConfig`] and a
//! [`Workspace`] into an [`Invocation`], hands it to a [`ProcessRunner`] and
//! classifies what came back:
//!
//! - launch failures mean the deployment is broken
//!   ([`Error::SynthesisUnavailable`]);
//! - everything else that does not leave a non-empty WAV file behind is a
//!   failed run ([`Error::SynthesisFailed`]), with the child's stderr kept for
//!   the server log.
//!
//! No retries happen here.

use crate::server::{
    config::SynthesisConfig,
    synthesis::{
        runner::{Invocation, ProcessRunner, RunError},
        workspace::Workspace,
    },
    telemetry::{
        decrement_syntheses_inflight, increment_syntheses_inflight, record_synthesis_duration,
    },
};
use piper_gateway_core::{Error, Result};
use std::{
    ffi::{OsStr, OsString},
    path::Path,
    sync::Arc,
    time::Instant,
};

/// Dynamic linker search variable extended with the configured library path.
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(windows)]
pub const LIBRARY_PATH_VAR: &str = "PATH";
#[cfg(not(any(target_os = "macos", windows)))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[cfg(windows)]
const SEARCH_PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const SEARCH_PATH_SEPARATOR: &str = ":";

/// Puts `fragment` in front of an existing search path value.
///
/// An unset or empty existing value yields `fragment` alone: a trailing
/// empty entry would make the dynamic linker search the working directory.
pub fn prepend_search_path(fragment: &Path, existing: Option<&OsStr>) -> OsString {
    let mut value = fragment.as_os_str().to_owned();
    if let Some(existing) = existing.filter(|v| !v.is_empty()) {
        value.push(SEARCH_PATH_SEPARATOR);
        value.push(existing);
    }
    value
}

pub struct ProcessInvoker<R> {
    config: Arc<SynthesisConfig>,
    runner: R,
}

impl<R: ProcessRunner> ProcessInvoker<R> {
    pub fn new(config: Arc<SynthesisConfig>, runner: R) -> Self {
        Self { config, runner }
    }

    /// Piper's argument list for a run writing to `output`.
    pub fn args(&self, output: &Path) -> Vec<OsString> {
        let config = &self.config;
        let mut args: Vec<OsString> = vec![
            "-m".into(),
            config.model.clone().into(),
            "-f".into(),
            output.to_owned().into(),
            "--espeak_data".into(),
            config.espeak_data.clone().into(),
            "--sentence-silence-seconds".into(),
            config.sentence_silence.to_string().into(),
        ];
        args.extend(config.extra_args.iter().map(OsString::from));
        args
    }

    /// Variables layered over the inherited environment.
    pub fn envs(&self) -> Vec<(OsString, OsString)> {
        let existing = std::env::var_os(LIBRARY_PATH_VAR);
        vec![(
            LIBRARY_PATH_VAR.into(),
            prepend_search_path(&self.config.library_path, existing.as_deref()),
        )]
    }

    /// Synthesizes `text` into the workspace file and returns the size of the
    /// resulting artifact in bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::SynthesisUnavailable`] if the executable cannot be launched.
    /// - [`Error::SynthesisFailed`] if it exits non-zero, is killed, cannot
    ///   take its input, or exits cleanly without writing audio.
    pub async fn invoke(&self, text: &str, workspace: &Workspace) -> Result<u64> {
        let mut stdin = Vec::with_capacity(text.len() + 1);
        stdin.extend_from_slice(text.as_bytes());
        stdin.push(b'\n');

        let invocation = Invocation {
            program: self.config.piper_bin.clone(),
            args: self.args(workspace.path()),
            envs: self.envs(),
            stdin,
            timeout: self.config.timeout,
        };

        let start = Instant::now();
        increment_syntheses_inflight();
        let result = self.runner.run(invocation).await;
        decrement_syntheses_inflight();
        record_synthesis_duration(start.elapsed().as_secs_f64() * 1000.0);

        let output = match result {
            Ok(output) => output,
            Err(e @ RunError::Spawn { .. }) => {
                return Err(Error::SynthesisUnavailable {
                    context: e.to_string(),
                });
            }
            Err(e) => {
                return Err(Error::SynthesisFailed {
                    context: e.to_string(),
                    stderr: String::new(),
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.success() {
            let context = match output.exit_code {
                Some(code) => format!("piper exited with status {code}"),
                None => "piper was terminated by a signal".to_string(),
            };
            return Err(Error::SynthesisFailed { context, stderr });
        }

        if let Some(e) = output.stdin_error {
            return Err(Error::SynthesisFailed {
                context: format!("could not write text to piper: {e}"),
                stderr,
            });
        }

        match tokio::fs::metadata(workspace.path()).await {
            Ok(meta) if meta.len() > 0 => Ok(meta.len()),
            Ok(_) => Err(Error::SynthesisFailed {
                context: "piper exited successfully but wrote no audio".to_string(),
                stderr,
            }),
            Err(e) => Err(Error::SynthesisFailed {
                context: format!("piper output is missing: {e}"),
                stderr,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::synthesis::{runner::ProcessOutput, workspace::WorkspaceAllocator};
    use std::{
        io,
        path::PathBuf,
        sync::Mutex,
        time::Duration,
    };

    /// Records the invocation and optionally writes audio to the `-f` path.
    struct FakeRunner {
        audio: &'static [u8],
        outcome: fn() -> std::result::Result<ProcessOutput, RunError>,
        seen: Mutex<Option<Invocation>>,
    }

    impl FakeRunner {
        fn new(
            audio: &'static [u8],
            outcome: fn() -> std::result::Result<ProcessOutput, RunError>,
        ) -> Self {
            Self {
                audio,
                outcome,
                seen: Mutex::new(None),
            }
        }
    }

    impl ProcessRunner for FakeRunner {
        async fn run(
            &self,
            invocation: Invocation,
        ) -> std::result::Result<ProcessOutput, RunError> {
            let out = invocation
                .args
                .iter()
                .position(|a| a == "-f")
                .map(|i| PathBuf::from(&invocation.args[i + 1]))
                .unwrap();
            std::fs::write(out, self.audio).unwrap();
            *self.seen.lock().unwrap() = Some(invocation);
            (self.outcome)()
        }
    }

    fn ok() -> std::result::Result<ProcessOutput, RunError> {
        Ok(ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    fn config(output_dir: &Path) -> Arc<SynthesisConfig> {
        Arc::new(SynthesisConfig {
            piper_bin: PathBuf::from("./piper_total/piper_new"),
            model: PathBuf::from("./piper_total/en_US-lessac-medium.onnx"),
            espeak_data: PathBuf::from("./piper_total/piper/espeak-ng-data"),
            library_path: PathBuf::from("./piper_total/piper"),
            sentence_silence: 0.5,
            extra_args: Vec::new(),
            output_dir: output_dir.to_owned(),
            timeout: Some(Duration::from_secs(5)),
            max_concurrent: None,
        })
    }

    async fn workspace(dir: &Path) -> Workspace {
        WorkspaceAllocator::new(dir).allocate().await.unwrap()
    }

    #[test]
    fn prepends_to_an_existing_search_path() {
        let value = prepend_search_path(Path::new("./lib"), Some(OsStr::new("/usr/lib")));
        assert_eq!(value, OsString::from(format!("./lib{SEARCH_PATH_SEPARATOR}/usr/lib")));
    }

    #[test]
    fn empty_search_path_gets_no_trailing_separator() {
        assert_eq!(
            prepend_search_path(Path::new("./lib"), None),
            OsString::from("./lib")
        );
        assert_eq!(
            prepend_search_path(Path::new("./lib"), Some(OsStr::new(""))),
            OsString::from("./lib")
        );
    }

    #[tokio::test]
    async fn argument_list_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = (*config(tmp.path())).clone();
        config.extra_args = vec!["--length_scale".into(), "1.1".into()];
        let invoker = ProcessInvoker::new(Arc::new(config), FakeRunner::new(b"", ok));

        let args = invoker.args(Path::new("temp/output_X.wav"));
        let expected: Vec<OsString> = [
            "-m",
            "./piper_total/en_US-lessac-medium.onnx",
            "-f",
            "temp/output_X.wav",
            "--espeak_data",
            "./piper_total/piper/espeak-ng-data",
            "--sentence-silence-seconds",
            "0.5",
            "--length_scale",
            "1.1",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        assert_eq!(args, expected);
    }

    #[tokio::test]
    async fn sends_text_with_newline_and_library_path() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = ProcessInvoker::new(config(tmp.path()), FakeRunner::new(b"RIFF", ok));
        let ws = workspace(tmp.path()).await;

        let len = invoker.invoke("hello world", &ws).await.unwrap();
        assert_eq!(len, 4);

        let seen = invoker.runner.seen.lock().unwrap().take().unwrap();
        assert_eq!(seen.stdin, b"hello world\n");
        assert_eq!(seen.program, PathBuf::from("./piper_total/piper_new"));
        assert_eq!(seen.timeout, Some(Duration::from_secs(5)));
        let (key, value) = &seen.envs[0];
        assert_eq!(key, LIBRARY_PATH_VAR);
        assert!(value.to_string_lossy().starts_with("./piper_total/piper"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_synthesis_failed_with_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = ProcessInvoker::new(
            config(tmp.path()),
            FakeRunner::new(b"partial", || {
                Ok(ProcessOutput {
                    exit_code: Some(1),
                    stderr: b"model not found\n".to_vec(),
                    ..Default::default()
                })
            }),
        );
        let ws = workspace(tmp.path()).await;

        match invoker.invoke("hi", &ws).await.unwrap_err() {
            Error::SynthesisFailed { context, stderr } => {
                assert!(context.contains("status 1"));
                assert_eq!(stderr, "model not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_synthesis_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = ProcessInvoker::new(
            config(tmp.path()),
            FakeRunner::new(b"", || {
                Err(RunError::Spawn {
                    program: PathBuf::from("./piper_total/piper_new"),
                    source: io::Error::from(io::ErrorKind::NotFound),
                })
            }),
        );
        let ws = workspace(tmp.path()).await;

        let err = invoker.invoke("hi", &ws).await.unwrap_err();
        assert!(matches!(err, Error::SynthesisUnavailable { .. }));
    }

    #[tokio::test]
    async fn stdin_failure_is_synthesis_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = ProcessInvoker::new(
            config(tmp.path()),
            FakeRunner::new(b"RIFF", || {
                Ok(ProcessOutput {
                    exit_code: Some(0),
                    stdin_error: Some("Broken pipe (os error 32)".into()),
                    ..Default::default()
                })
            }),
        );
        let ws = workspace(tmp.path()).await;

        let err = invoker.invoke("hi", &ws).await.unwrap_err();
        assert!(matches!(err, Error::SynthesisFailed { .. }));
    }

    #[tokio::test]
    async fn clean_exit_without_audio_is_synthesis_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = ProcessInvoker::new(config(tmp.path()), FakeRunner::new(b"", ok));
        let ws = workspace(tmp.path()).await;

        match invoker.invoke("hi", &ws).await.unwrap_err() {
            Error::SynthesisFailed { context, .. } => assert!(context.contains("no audio")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_synthesis_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = ProcessInvoker::new(
            config(tmp.path()),
            FakeRunner::new(b"", || Err(RunError::TimedOut(Duration::from_secs(5)))),
        );
        let ws = workspace(tmp.path()).await;

        let err = invoker.invoke("hi", &ws).await.unwrap_err();
        assert!(matches!(err, Error::SynthesisFailed { .. }));
    }
}
