use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::EngineConfig;
use crate::core::{Recipe, ServingEngine};
use crate::templates::RenderedConfig;

/// Which of an environment's two processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Runtime,
    Serving,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Runtime => f.write_str("php-fpm runtime"),
            ProcessRole::Serving => f.write_str("serving engine"),
        }
    }
}

/// Signal asking a process to finish in-flight work and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Quit,
    Terminate,
}

/// Everything needed to (re)spawn one supervised process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub recipe_name: String,
    pub role: ProcessRole,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stop_signal: StopSignal,
}

impl ProcessSpec {
    /// PHP-FPM master running the recipe's pool in the foreground.
    pub fn runtime(recipe: &Recipe, rendered: &RenderedConfig, runtimes_dir: &Path) -> Self {
        Self {
            recipe_name: recipe.name.clone(),
            role: ProcessRole::Runtime,
            program: resolve_runtime_binary(runtimes_dir, &recipe.runtime_series()),
            args: vec![
                "--nodaemonize".to_string(),
                "--fpm-config".to_string(),
                rendered.runtime.path.to_string_lossy().to_string(),
            ],
            working_dir: rendered.directory.clone(),
            stop_signal: StopSignal::Quit,
        }
    }

    pub fn serving(recipe: &Recipe, rendered: &RenderedConfig, engines: &EngineConfig) -> Self {
        let server_conf = rendered.server.path.to_string_lossy().to_string();
        let (binary, args, stop_signal) = match recipe.serving_engine {
            ServingEngine::Nginx => (
                &engines.nginx_binary,
                vec![
                    "-p".to_string(),
                    rendered.directory.to_string_lossy().to_string(),
                    "-c".to_string(),
                    server_conf,
                ],
                StopSignal::Quit,
            ),
            ServingEngine::Apache => (
                &engines.apache_binary,
                vec![
                    "-f".to_string(),
                    server_conf,
                    "-DFOREGROUND".to_string(),
                ],
                StopSignal::Terminate,
            ),
        };

        Self {
            recipe_name: recipe.name.clone(),
            role: ProcessRole::Serving,
            program: resolve_binary(binary),
            args,
            working_dir: rendered.directory.clone(),
            stop_signal,
        }
    }

    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Looks `name` up on `PATH`. Unresolved names are returned as-is so the
/// spawn fails with a descriptive error.
pub fn resolve_binary(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

/// PHP-FPM for a series: `<runtimes>/<series>/sbin/php-fpm`, then
/// `php-fpm<series>` and `php-fpm` on `PATH`.
pub fn resolve_runtime_binary(runtimes_dir: &Path, series: &str) -> PathBuf {
    let bundled = runtimes_dir.join(series).join("sbin").join("php-fpm");
    if bundled.is_file() {
        return bundled;
    }

    [format!("php-fpm{}", series), "php-fpm".to_string()]
        .iter()
        .find_map(|name| which::which(name).ok())
        .unwrap_or_else(|| PathBuf::from("php-fpm"))
}

/// A spawned process as seen by the supervisor.
#[async_trait]
pub trait ChildProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// `Some(code)` once the process has exited; the code is `None` when
    /// it was killed by a signal.
    fn try_wait(&mut self) -> io::Result<Option<Option<i32>>>;

    fn signal(&mut self, signal: StopSignal) -> io::Result<()>;

    async fn kill(&mut self) -> io::Result<()>;

    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Most recent stdout/stderr lines.
    fn recent_output(&self) -> Vec<String>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, spec: &ProcessSpec) -> io::Result<Box<dyn ChildProcess>>;
}

/// Ring buffer of captured output lines shared with the reader tasks.
#[derive(Clone)]
pub struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn capture<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.push(line);
            }
        });
    }
}

/// Spawns real processes with `tokio::process`.
pub struct OsLauncher {
    output_lines: usize,
}

impl OsLauncher {
    pub fn new(output_lines: usize) -> Self {
        Self { output_lines }
    }
}

#[async_trait]
impl ProcessLauncher for OsLauncher {
    async fn spawn(&self, spec: &ProcessSpec) -> io::Result<Box<dyn ChildProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a forced kill also takes the workers.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let output = OutputBuffer::new(self.output_lines);
        if let Some(stdout) = child.stdout.take() {
            output.capture(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            output.capture(stderr);
        }

        debug!(
            "Spawned {} for '{}' (pid {:?}): {}",
            spec.role,
            spec.recipe_name,
            child.id(),
            spec.display()
        );
        Ok(Box::new(OsChild { child, output }))
    }
}

struct OsChild {
    child: Child,
    output: OutputBuffer,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(|status| status.code()))
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: StopSignal) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let signal = match signal {
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Terminate => Signal::SIGTERM,
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: StopSignal) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }

        match self.child.kill().await {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    fn recent_output(&self) -> Vec<String> {
        self.output.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Allocation, HostnameBinding};
    use crate::templates::RenderedFile;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    fn rendered(dir: &Path, engine: ServingEngine) -> RenderedConfig {
        let server = match engine {
            ServingEngine::Nginx => "nginx.conf",
            ServingEngine::Apache => "httpd.conf",
        };
        RenderedConfig {
            recipe_name: "alpha".into(),
            engine,
            directory: dir.to_path_buf(),
            server: RenderedFile {
                path: dir.join(server),
                contents: String::new(),
            },
            runtime: RenderedFile {
                path: dir.join("php-fpm.conf"),
                contents: String::new(),
            },
            runtime_socket: dir.join("run/php-fpm.sock"),
            allocation: Allocation {
                recipe_name: "alpha".into(),
                port: 8081,
                hostname_binding: HostnameBinding {
                    address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    hostname: "alpha.test".into(),
                },
            },
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn output_buffer_keeps_most_recent_lines() {
        let buffer = OutputBuffer::new(2);
        for line in ["one", "two", "three"] {
            buffer.push(line.to_string());
        }
        assert_eq!(buffer.snapshot(), vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn prefers_bundled_runtime_binary() {
        let dir = tempdir().unwrap();
        let sbin = dir.path().join("8.2").join("sbin");
        std::fs::create_dir_all(&sbin).unwrap();
        std::fs::write(sbin.join("php-fpm"), "").unwrap();

        assert_eq!(
            resolve_runtime_binary(dir.path(), "8.2"),
            sbin.join("php-fpm")
        );
    }

    #[test]
    fn builds_engine_specific_command_lines() {
        let dir = tempdir().unwrap();
        let recipe = Recipe::new("alpha", "/srv/alpha", "8.2", ServingEngine::Apache, "alpha.test");
        let engines = EngineConfig {
            apache_binary: "furnace-test-no-such-httpd".into(),
            ..EngineConfig::default()
        };

        let serving = ProcessSpec::serving(&recipe, &rendered(dir.path(), ServingEngine::Apache), &engines);
        assert_eq!(serving.program, PathBuf::from("furnace-test-no-such-httpd"));
        assert_eq!(serving.args.last().map(String::as_str), Some("-DFOREGROUND"));
        assert_eq!(serving.stop_signal, StopSignal::Terminate);

        let runtime = ProcessSpec::runtime(&recipe, &rendered(dir.path(), ServingEngine::Apache), dir.path());
        assert_eq!(runtime.role, ProcessRole::Runtime);
        assert_eq!(runtime.stop_signal, StopSignal::Quit);
        assert!(runtime.args.contains(&"--nodaemonize".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn os_launcher_captures_output_and_stops_children() {
        let dir = tempdir().unwrap();
        let launcher = OsLauncher::new(10);
        let spec = ProcessSpec {
            recipe_name: "alpha".into(),
            role: ProcessRole::Runtime,
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "echo ready; exec sleep 30".into()],
            working_dir: dir.path().to_path_buf(),
            stop_signal: StopSignal::Terminate,
        };

        let mut child = launcher.spawn(&spec).await.unwrap();
        assert!(child.id().is_some());
        assert_eq!(child.try_wait().unwrap(), None);

        for _ in 0..50 {
            if !child.recent_output().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(child.recent_output(), vec!["ready".to_string()]);

        child.signal(StopSignal::Terminate).unwrap();
        let code = child.wait().await.unwrap();
        assert_eq!(code, None);
        assert!(child.kill().await.is_ok());
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let dir = tempdir().unwrap();
        let spec = ProcessSpec {
            recipe_name: "alpha".into(),
            role: ProcessRole::Serving,
            program: PathBuf::from("furnace-test-no-such-binary"),
            args: vec![],
            working_dir: dir.path().to_path_buf(),
            stop_signal: StopSignal::Quit,
        };
        assert!(OsLauncher::new(10).spawn(&spec).await.is_err());
    }
}
