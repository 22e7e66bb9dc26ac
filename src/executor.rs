use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::benchmark::Benchmark;
use crate::cancel::CancelToken;
use crate::error::ExecError;
use crate::param::ParamVector;

/// What a benchmark's exit code means.
///
/// `None` stands for a process that was killed by a signal.
pub fn describe_exit(code: Option<i32>) -> String {
    let what = match code {
        None => return "a signal".to_string(),
        Some(0) => "success",
        Some(1) => "argument-count failure",
        Some(2) => "argument-parse failure",
        Some(3) => "allocation failure",
        Some(4) => "routine failure",
        Some(5) => "general failure",
        Some(_) => "unknown failure",
    };
    format!("status {} ({})", code.unwrap_or_default(), what)
}

/// Parse what a successful benchmark printed into a [`Benchmark`] at `params`.
///
/// The expected format is three lines: wall-clock seconds and microseconds, CPU seconds and
/// microseconds, and the operation count.
pub fn parse_output(stdout: &str, params: &ParamVector) -> Result<Benchmark, ExecError> {
    let malformed = |reason: &str| ExecError::MalformedOutput {
        reason: reason.to_string(),
        output: stdout.to_string(),
    };

    let mut lines = stdout.lines();
    let mut time = |what: &str| -> Result<Duration, ExecError> {
        let line = lines.next().ok_or_else(|| malformed(&format!("missing {} time", what)))?;
        let mut fields = line.split_whitespace().map(str::parse::<u64>);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(Ok(sec)), Some(Ok(usec)), None) => {
                Ok(Duration::from_secs(sec) + Duration::from_micros(usec))
            }
            _ => Err(malformed(&format!("bad {} time `{}`", what, line))),
        }
    };
    let wall = time("wall")?;
    let used = time("used")?;
    let complexity = match lines.next().map(|l| l.trim().parse::<u64>()) {
        Some(Ok(c)) => c,
        Some(Err(_)) => return Err(malformed("bad complexity")),
        None => return Err(malformed("missing complexity")),
    };
    if lines.any(|l| !l.trim().is_empty()) {
        return Err(malformed("trailing output"));
    }
    if wall.is_zero() {
        return Err(malformed("zero wall time"));
    }
    if complexity == 0 {
        return Err(malformed("zero complexity"));
    }
    Ok(Benchmark::new(params.clone(), complexity, wall, used))
}

/// Kills and reaps the child unless it has already been waited for.
struct ChildGuard(Option<Child>);

impl ChildGuard {
    fn kill(&mut self) {
        if let Some(mut child) = self.0.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        match self.0.take() {
            Some(mut child) => child.wait(),
            None => Err(io::Error::new(io::ErrorKind::Other, "child already reaped")),
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Failed(io::Error),
}

fn pump<R: Read>(mut reader: R, tx: &mpsc::Sender<Chunk>, wrap: fn(Vec<u8>) -> Chunk) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.send(Chunk::Failed(e));
                break;
            }
        }
    }
}

/// Runs benchmark executables and collects what they measured.
#[derive(Debug, Clone)]
pub struct Executor {
    poll_timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Executor {
            poll_timeout: Duration::from_secs(5),
        }
    }
}

impl Executor {
    /// An executor that checks for cancellation at least every `poll_timeout`.
    pub fn new(poll_timeout: Duration) -> Self {
        Executor { poll_timeout }
    }

    /// How long a cancelled run may take to notice.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Run `exe` with `args` followed by the values of `params`, and parse what it measured.
    ///
    /// If `cancel` fires while the benchmark is running, the child is killed and
    /// [`ExecError::Cancelled`] is returned.
    pub fn run(
        &self,
        exe: &Path,
        args: &[String],
        params: &ParamVector,
        cancel: &CancelToken,
    ) -> Result<Benchmark, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        debug!(exe = %exe.display(), point = %params, "running benchmark");

        let mut child = Command::new(exe)
            .args(args)
            .args(params.iter().map(i64::to_string))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                path: exe.to_path_buf(),
                source,
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut guard = ChildGuard(Some(child));

        let (tx, rx) = mpsc::channel();
        if let Some(out) = stdout {
            let tx = tx.clone();
            thread::spawn(move || pump(out, &tx, Chunk::Stdout));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            thread::spawn(move || pump(err, &tx, Chunk::Stderr));
        }
        drop(tx);

        let mut out = Vec::new();
        let mut merged = Vec::new();
        loop {
            if cancel.is_cancelled() {
                guard.kill();
                debug!(exe = %exe.display(), "benchmark cancelled");
                return Err(ExecError::Cancelled);
            }
            match rx.recv_timeout(self.poll_timeout) {
                Ok(Chunk::Stdout(bytes)) => {
                    out.extend_from_slice(&bytes);
                    merged.extend_from_slice(&bytes);
                }
                Ok(Chunk::Stderr(bytes)) => merged.extend_from_slice(&bytes),
                Ok(Chunk::Failed(e)) => return Err(ExecError::Read(e)),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                // both pipes hit end of file
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = guard.wait().map_err(ExecError::Read)?;
        let output = String::from_utf8_lossy(&merged).into_owned();
        trace!(exe = %exe.display(), %output, "benchmark output");
        if !status.success() {
            return Err(ExecError::NonZeroExit {
                code: status.code(),
                output,
            });
        }
        parse_output(&String::from_utf8_lossy(&out), params).map_err(|e| match e {
            ExecError::MalformedOutput { reason, .. } => ExecError::MalformedOutput { reason, output },
            e => e,
        })
    }
}

#[cfg(test)]
fn shell(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string(), "bench".to_string()]
}

#[test]
fn parses_benchmark_output() {
    let p = ParamVector::new(vec![7]);
    let b = parse_output("3 500000\n2 0\n1000000\n", &p).unwrap();
    assert_eq!(b.params, p);
    assert_eq!(b.wall, Duration::from_millis(3500));
    assert_eq!(b.used, Duration::from_secs(2));
    assert_eq!(b.complexity, 1_000_000);
    assert!((b.flops - 285_714.285).abs() < 1.0);
}

#[test]
fn rejects_malformed_output() {
    let p = ParamVector::new(vec![1]);
    for bad in &[
        "",
        "3 500000\n",
        "3 500000\n2 0\n",
        "3\n2 0\n100\n",
        "0 0\n0 0\n100\n",
        "1 0\n1 0\n0\n",
        "1 0\n1 0\nlots\n",
        "1 0\n1 0\n100\nmore\n",
    ] {
        assert!(
            matches!(parse_output(bad, &p), Err(ExecError::MalformedOutput { .. })),
            "{:?} was accepted",
            bad
        );
    }
}

#[test]
fn exit_descriptions() {
    assert_eq!(describe_exit(Some(4)), "status 4 (routine failure)");
    assert_eq!(describe_exit(Some(42)), "status 42 (unknown failure)");
    assert_eq!(describe_exit(None), "a signal");
}

#[test]
fn runs_a_benchmark() {
    let e = Executor::new(Duration::from_millis(50));
    // the parameters arrive after the static arguments
    let script = r#"test "$1" = 3 && test "$2" = 9 && printf '3 500000\n2 0\n1000000\n'"#;
    let b = e
        .run(
            Path::new("/bin/sh"),
            &shell(script),
            &ParamVector::new(vec![3, 9]),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(b.wall, Duration::from_millis(3500));
    assert_eq!(b.params, ParamVector::new(vec![3, 9]));
}

#[test]
fn nonzero_exit_keeps_output() {
    let e = Executor::new(Duration::from_millis(50));
    let r = e.run(
        Path::new("/bin/sh"),
        &shell("echo out; echo oops >&2; exit 4"),
        &ParamVector::new(vec![1]),
        &CancelToken::new(),
    );
    match r {
        Err(ExecError::NonZeroExit { code, output }) => {
            assert_eq!(code, Some(4));
            assert!(output.contains("out"));
            assert!(output.contains("oops"));
        }
        r => panic!("unexpected {:?}", r),
    }
}

#[test]
fn failure_output_is_reported() {
    let e = Executor::new(Duration::from_millis(50));
    let p = ParamVector::new(vec![1]);
    let quit = CancelToken::new();

    let err = e
        .run(Path::new("/bin/sh"), &shell("echo 'dgemm: bad lda' >&2; exit 4"), &p, &quit)
        .unwrap_err();
    assert!(err.output().unwrap().contains("bad lda"));

    let err = e
        .run(Path::new("/bin/sh"), &shell("echo 'warming up' >&2; echo garbage"), &p, &quit)
        .unwrap_err();
    assert!(matches!(err, ExecError::MalformedOutput { .. }));
    assert!(err.output().unwrap().contains("warming up"));

    let err = e.run(Path::new("/nonexistent/benchmark"), &[], &p, &quit).unwrap_err();
    assert!(err.output().is_none());
}

#[test]
fn missing_executable() {
    let e = Executor::default();
    let r = e.run(
        Path::new("/nonexistent/benchmark"),
        &[],
        &ParamVector::new(vec![1]),
        &CancelToken::new(),
    );
    assert!(matches!(r, Err(ExecError::Spawn { .. })));
}

#[test]
fn cancel_kills_the_child() {
    use std::time::Instant;

    let e = Executor::new(Duration::from_millis(20));
    let cancel = CancelToken::new();
    let c = cancel.clone();
    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        c.cancel();
    });
    let start = Instant::now();
    let r = e.run(
        Path::new("/bin/sh"),
        &shell("exec sleep 30"),
        &ParamVector::new(vec![1]),
        &cancel,
    );
    t.join().unwrap();
    assert!(matches!(r, Err(ExecError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn cancelled_before_start() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let r = Executor::default().run(Path::new("/bin/true"), &[], &ParamVector::new(vec![1]), &cancel);
    assert!(r.unwrap_err().is_cancelled());
}
