/// Child bootstrap: fork and exec the shell (or `--exec` command) with a
/// filtered environment, before any runtime or window exists.
///
/// Everything that allocates happens in the parent. Between `fork` and
/// `execve` the child only calls `chdir`, `write` and `_exit`.
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::BTreeMap;
use std::ffi::{CString, NulError, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Interpreter used for shell invocations.
pub const SHELL: &str = "/bin/sh";

/// Child exit status when `chdir` fails.
pub const EXIT_CHDIR_FAILED: i32 = 126;

/// Child exit status when `execve` fails.
pub const EXIT_EXEC_FAILED: i32 = 127;

const CHDIR_FAILED_MSG: &[u8] = b"termhost: child could not change to its working directory\n";
const EXEC_FAILED_MSG: &[u8] = b"termhost: child could not execute its command\n";

/// Characters that make a command string need a shell.
const SHELL_META: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '*', '?', '[', ']', '#', '~',
    '=', '{', '}',
];

/// What the child runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildCommand {
    /// An explicit executable, run without arguments.
    Program(String),
    /// A command line handed to `/bin/sh -c`.
    Shell(String),
}

impl ChildCommand {
    /// Plain words are executables; anything with whitespace or shell syntax
    /// goes through the shell.
    pub fn parse(command: &str) -> Self {
        let command = command.trim();
        if command.contains(char::is_whitespace) || command.contains(SHELL_META) {
            ChildCommand::Shell(command.to_string())
        } else {
            ChildCommand::Program(command.to_string())
        }
    }

    /// The program image to exec (before `PATH` resolution).
    pub fn program(&self) -> &str {
        match self {
            ChildCommand::Program(program) => program,
            ChildCommand::Shell(_) => SHELL,
        }
    }

    /// Full argument vector, `argv[0]` included.
    pub fn argv(&self) -> Vec<String> {
        match self {
            ChildCommand::Program(program) => vec![program.clone()],
            ChildCommand::Shell(line) => vec![SHELL.to_string(), "-c".to_string(), line.clone()],
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            ChildCommand::Program(s) | ChildCommand::Shell(s) => s.is_empty(),
        }
    }
}

/// Which inherited variables the child must not see, and which to force.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvPolicy {
    /// Exact names, or `PREFIX*` patterns.
    pub remove: Vec<String>,
    /// Variables set in the child, overriding inherited values.
    pub set: BTreeMap<String, String>,
}

impl EnvPolicy {
    pub fn is_removed(&self, key: &OsStr) -> bool {
        let key = key.as_bytes();
        self.remove
            .iter()
            .any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => key.starts_with(prefix.as_bytes()),
                None => key == pattern.as_bytes(),
            })
    }

    /// Build the child's environment from `inherited`. The host's own
    /// environment is only read, never changed.
    pub fn apply<I>(&self, inherited: I) -> Vec<(OsString, OsString)>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut env: Vec<(OsString, OsString)> = inherited
            .into_iter()
            .filter(|(key, _)| {
                let overridden = key.to_str().is_some_and(|k| self.set.contains_key(k));
                !overridden && !self.is_removed(key)
            })
            .collect();
        env.extend(
            self.set
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        env
    }
}

/// Everything needed to start the child.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub command: ChildCommand,
    pub directory: PathBuf,
    pub env: EnvPolicy,
}

/// Errors that can occur before or during `fork`. All are fatal to the host.
#[derive(Debug)]
pub enum SpawnError {
    /// The command string was blank.
    EmptyCommand,
    /// An argument, variable or path contained an interior NUL byte.
    Nul {
        what: &'static str,
        source: NulError,
    },
    /// `fork` itself failed.
    Fork(Errno),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::EmptyCommand => write!(f, "child command is empty"),
            SpawnError::Nul { what, source } => {
                write!(f, "child {what} contains a NUL byte: {source}")
            }
            SpawnError::Fork(e) => write!(f, "failed to fork child process: {e}"),
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::EmptyCommand => None,
            SpawnError::Nul { source, .. } => Some(source),
            SpawnError::Fork(e) => Some(e),
        }
    }
}

/// Handle on the spawned child, held by the host until shutdown.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    /// Set by whoever collects the exit status. Once set, `pid` may belong
    /// to an unrelated process.
    reaped: Arc<AtomicBool>,
}

impl ChildProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Flag shared with a watchdog that reaps this child.
    pub fn reaped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reaped)
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    /// Tell a still-running child its terminal is going away, and reap it if
    /// it has already exited. Returns whether `SIGHUP` was sent.
    pub fn hang_up(self) -> bool {
        if self.is_reaped() {
            debug!(pid = self.pid.as_raw(), "child exit already collected, not signalling");
            return false;
        }
        let signalled = match kill(self.pid, Signal::SIGHUP) {
            Ok(()) => {
                debug!(pid = self.pid.as_raw(), "sent SIGHUP to child");
                true
            }
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pid = self.pid.as_raw(), error = %e, "failed to signal child");
                false
            }
        };
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                debug!(pid = self.pid.as_raw(), "child still running after hangup")
            }
            Ok(status) => {
                self.reaped.store(true, Ordering::Release);
                debug!(?status, "child reaped");
            }
            Err(e) => debug!(pid = self.pid.as_raw(), error = %e, "child not waitable"),
        }
        signalled
    }
}

/// Argument, environment and directory buffers built before `fork`.
struct PreparedExec {
    program: CString,
    directory: CString,
    _args: Vec<CString>,
    _vars: Vec<CString>,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
}

impl PreparedExec {
    fn new(spec: &ChildSpec, env: Vec<(OsString, OsString)>) -> Result<Self, SpawnError> {
        if spec.command.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }
        let search_path = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .or_else(|| std::env::var_os("PATH"));
        let program = resolve_program(spec.command.program(), search_path.as_deref());
        let program = CString::new(program.into_os_string().into_vec())
            .map_err(|source| SpawnError::Nul { what: "program", source })?;
        let directory = CString::new(spec.directory.as_os_str().as_bytes())
            .map_err(|source| SpawnError::Nul { what: "directory", source })?;
        let args = spec
            .command
            .argv()
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SpawnError::Nul { what: "argument", source })?;
        let vars = env
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend(value.into_vec());
                CString::new(entry)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SpawnError::Nul { what: "environment variable", source })?;

        let argv = null_terminated(&args);
        let envp = null_terminated(&vars);
        Ok(Self {
            program,
            directory,
            _args: args,
            _vars: vars,
            argv,
            envp,
        })
    }

    /// Runs in the forked child. Never returns.
    fn exec_child(&self) -> ! {
        // SAFETY: chdir, execve, write and _exit are async-signal-safe, and
        // every pointer refers to memory allocated before fork.
        unsafe {
            if libc::chdir(self.directory.as_ptr()) != 0 {
                child_fail(CHDIR_FAILED_MSG, EXIT_CHDIR_FAILED);
            }
            libc::execve(self.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
            child_fail(EXEC_FAILED_MSG, EXIT_EXEC_FAILED)
        }
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Report a setup failure from the forked child and exit without running
/// any of the parent's cleanup.
unsafe fn child_fail(message: &[u8], status: i32) -> ! {
    libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    libc::_exit(status)
}

/// Resolve `name` against `search_path` the way `execvp` would. Names with a
/// slash are used as-is; unresolvable names are returned unchanged so the
/// child's `execve` reports the failure.
pub fn resolve_program(name: &str, search_path: Option<&OsStr>) -> PathBuf {
    if name.contains('/') {
        return PathBuf::from(name);
    }
    search_path
        .into_iter()
        .flat_map(|paths| std::env::split_paths(paths))
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(name))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The user's login shell from the password database, or `/bin/sh`.
pub fn login_shell() -> PathBuf {
    match nix::unistd::User::from_uid(nix::unistd::geteuid()) {
        Ok(Some(user)) if !user.shell.as_os_str().is_empty() => user.shell,
        _ => PathBuf::from(SHELL),
    }
}

/// Fork and exec the child described by `spec`. Returns as soon as the
/// child exists; never waits for it.
pub fn spawn(spec: &ChildSpec) -> Result<ChildProcess, SpawnError> {
    let env = spec.env.apply(std::env::vars_os());
    let exec = PreparedExec::new(spec, env)?;

    // SAFETY: the child branch only runs async-signal-safe calls until exec.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            info!(
                pid = child.as_raw(),
                command = ?spec.command.argv(),
                directory = %spec.directory.display(),
                "child process started"
            );
            Ok(ChildProcess {
                pid: child,
                reaped: Arc::new(AtomicBool::new(false)),
            })
        }
        Ok(ForkResult::Child) => exec.exec_child(),
        Err(e) => Err(SpawnError::Fork(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg};
    use std::os::fd::{AsRawFd, RawFd};

    fn wait_exit(pid: Pid) -> WaitStatus {
        waitpid(pid, None).unwrap()
    }

    /// Target and descriptor flags of each of `fds`, as the kernel reports them.
    fn descriptor_state(fds: &[RawFd]) -> Vec<(RawFd, PathBuf, i32)> {
        fds.iter()
            .map(|&fd| {
                let target = std::fs::read_link(format!("/proc/self/fd/{fd}")).unwrap();
                let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
                (fd, target, flags)
            })
            .collect()
    }

    fn spec(command: ChildCommand, directory: &Path) -> ChildSpec {
        ChildSpec {
            command,
            directory: directory.to_path_buf(),
            env: EnvPolicy::default(),
        }
    }

    #[test]
    fn test_parse_plain_word_is_program() {
        assert_eq!(
            ChildCommand::parse("/bin/zsh"),
            ChildCommand::Program("/bin/zsh".to_string())
        );
        assert_eq!(
            ChildCommand::parse("  fish "),
            ChildCommand::Program("fish".to_string())
        );
    }

    #[test]
    fn test_parse_command_line_is_shell() {
        assert_eq!(
            ChildCommand::parse("vim notes.txt"),
            ChildCommand::Shell("vim notes.txt".to_string())
        );
        assert_eq!(
            ChildCommand::parse("top|less"),
            ChildCommand::Shell("top|less".to_string())
        );
        assert_eq!(
            ChildCommand::parse("$EDITOR"),
            ChildCommand::Shell("$EDITOR".to_string())
        );
    }

    #[test]
    fn test_argv_for_shell_invocation() {
        let cmd = ChildCommand::Shell("echo hi".to_string());
        assert_eq!(cmd.program(), "/bin/sh");
        assert_eq!(cmd.argv(), vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_env_policy_strips_exact_and_prefixed_names() {
        let policy = EnvPolicy {
            remove: vec!["WINDOWID".to_string(), "QT_*".to_string()],
            set: BTreeMap::new(),
        };
        let inherited = vec![
            (OsString::from("WINDOWID"), OsString::from("123")),
            (OsString::from("QT_SCALE_FACTOR"), OsString::from("2")),
            (OsString::from("WINDOWID_EXTRA"), OsString::from("kept")),
            (OsString::from("HOME"), OsString::from("/home/u")),
        ];
        let env = policy.apply(inherited);
        let keys: Vec<_> = env.iter().map(|(k, _)| k.to_str().unwrap()).collect();
        assert_eq!(keys, vec!["WINDOWID_EXTRA", "HOME"]);
    }

    #[test]
    fn test_env_policy_set_overrides_inherited() {
        let mut set = BTreeMap::new();
        set.insert("TERM".to_string(), "xterm-256color".to_string());
        let policy = EnvPolicy {
            remove: Vec::new(),
            set,
        };
        let env = policy.apply(vec![
            (OsString::from("TERM"), OsString::from("dumb")),
            (OsString::from("LANG"), OsString::from("C")),
        ]);
        let terms: Vec<_> = env.iter().filter(|(k, _)| k == "TERM").collect();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].1, "xterm-256color");
        assert!(env.iter().any(|(k, v)| k == "LANG" && v == "C"));
    }

    #[test]
    fn test_resolve_program_searches_path() {
        let resolved = resolve_program("sh", Some(OsStr::new("/nonexistent-dir:/bin")));
        assert_eq!(resolved, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_program_keeps_slash_names_and_unknowns() {
        assert_eq!(
            resolve_program("./run.sh", Some(OsStr::new("/bin"))),
            PathBuf::from("./run.sh")
        );
        assert_eq!(
            resolve_program("no-such-program-xyz", Some(OsStr::new("/bin"))),
            PathBuf::from("no-such-program-xyz")
        );
    }

    #[test]
    fn test_spawn_true_leaves_parent_untouched() {
        let cwd_before = std::env::current_dir().unwrap();
        let env_before: BTreeMap<OsString, OsString> = std::env::vars_os().collect();

        // Other tests open descriptors concurrently, so only the ones held
        // here are compared.
        let file = tempfile::tempfile().unwrap();
        let (read, write) = nix::unistd::pipe().unwrap();
        let held = [file.as_raw_fd(), read.as_raw_fd(), write.as_raw_fd()];
        let fds_before = descriptor_state(&held);

        let child = spawn(&spec(
            ChildCommand::Program("/bin/true".to_string()),
            Path::new("/tmp"),
        ))
        .unwrap();
        assert!(child.pid().as_raw() > 0);

        assert_eq!(std::env::current_dir().unwrap(), cwd_before);
        let env_after: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        assert_eq!(env_after, env_before);
        assert_eq!(descriptor_state(&held), fds_before);

        assert_eq!(wait_exit(child.pid()), WaitStatus::Exited(child.pid(), 0));
    }

    #[test]
    fn test_child_sees_directory_and_filtered_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = BTreeMap::new();
        set.insert("TERMHOST_PROBE".to_string(), "present".to_string());
        let child_spec = ChildSpec {
            command: ChildCommand::parse("pwd > pwd.txt; env > env.txt"),
            directory: dir.path().to_path_buf(),
            env: EnvPolicy {
                remove: vec!["HOME".to_string()],
                set,
            },
        };

        let child = spawn(&child_spec).unwrap();
        assert_eq!(wait_exit(child.pid()), WaitStatus::Exited(child.pid(), 0));

        let pwd = std::fs::read_to_string(dir.path().join("pwd.txt")).unwrap();
        assert_eq!(
            std::fs::canonicalize(pwd.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        let env = std::fs::read_to_string(dir.path().join("env.txt")).unwrap();
        assert!(env.lines().any(|l| l == "TERMHOST_PROBE=present"));
        assert!(!env.lines().any(|l| l.starts_with("HOME=")));
    }

    #[test]
    fn test_exec_failure_only_affects_child() {
        let child = spawn(&spec(
            ChildCommand::Program("/nonexistent-dir/no-such-binary".to_string()),
            Path::new("/tmp"),
        ))
        .unwrap();
        assert_eq!(
            wait_exit(child.pid()),
            WaitStatus::Exited(child.pid(), EXIT_EXEC_FAILED)
        );
    }

    #[test]
    fn test_missing_directory_exits_child() {
        let child = spawn(&spec(
            ChildCommand::Program("/bin/true".to_string()),
            Path::new("/nonexistent-dir/impossible"),
        ))
        .unwrap();
        assert_eq!(
            wait_exit(child.pid()),
            WaitStatus::Exited(child.pid(), EXIT_CHDIR_FAILED)
        );
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = spawn(&spec(ChildCommand::parse("   "), Path::new("/tmp"))).unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));
    }

    #[test]
    fn test_hang_up_terminates_running_child() {
        let child = spawn(&spec(ChildCommand::parse("exec sleep 5"), Path::new("/tmp"))).unwrap();
        let pid = child.pid();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(child.hang_up());
        match waitpid(pid, None) {
            Ok(status) => assert_eq!(status, WaitStatus::Signaled(pid, Signal::SIGHUP, false)),
            // hang_up may already have reaped it
            Err(e) => assert_eq!(e, Errno::ECHILD),
        }
    }

    #[test]
    fn test_login_shell_is_absolute() {
        assert!(login_shell().is_absolute());
    }
}
