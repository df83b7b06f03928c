//! Process discovery and status through the `/proc` filesystem.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::unistd::Pid;

use crate::error::{Error, Result};

const PROC_ROOT: &str = "/proc";

/// The kernel stores at most 15 bytes of an executable name in the
/// stat record's `comm` field.
pub const COMM_LEN: usize = 15;

/// Handle to a live process, named by pid.
///
/// The handle owns no kernel resource; it is a pid plus the path of the
/// process' `/proc` directory, validated to exist at construction.
#[derive(Debug, Clone)]
pub struct Process {
    pid: Pid,
    dir: PathBuf,
}

impl Process {
    /// Opens a process by pid.
    pub fn open(pid: Pid) -> Result<Self> {
        let dir = Path::new(PROC_ROOT).join(pid.to_string());
        if !dir.is_dir() {
            return Err(Error::NoProcess(pid));
        }

        Ok(Self { pid, dir })
    }

    /// Opens a process by its `/proc/<pid>` directory path.
    pub fn from_procfs_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(OsStr::to_str)
            .filter(|name| is_numeric(name))
            .ok_or_else(|| {
                Error::Argument(format!(
                    "not a procfs process directory: {}",
                    path.display()
                ))
            })?;

        let pid = name
            .parse::<i32>()
            .map(Pid::from_raw)
            .map_err(|_| Error::Argument(format!("pid out of range: {name}")))?;

        if !path.is_dir() {
            return Err(Error::NoProcess(pid));
        }

        Ok(Self {
            pid,
            dir: path.to_path_buf(),
        })
    }

    /// Handle to the calling process.
    pub fn current() -> Result<Self> {
        Self::open(nix::unistd::getpid())
    }

    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// The process' `/proc` directory.
    pub fn procfs_dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves the `exe` symlink to the executable's path.
    pub fn executable_path(&self) -> Result<PathBuf> {
        let path = self.dir.join("exe");
        fs::read_link(&path).map_err(|e| Error::File(path, e))
    }

    /// Reads a snapshot of the process' stat record.
    pub fn status(&self) -> Result<ProcessStatus> {
        let path = self.dir.join("stat");
        let line = fs::read_to_string(&path).map_err(|e| Error::File(path, e))?;
        ProcessStatus::parse(&line)
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

impl Eq for Process {}

impl std::hash::Hash for Process {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pid.hash(state);
    }
}

/// Run state of a process, derived from the stat record's state
/// character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    /// Uninterruptible disk sleep.
    Waiting,
    Zombie,
    /// Stopped on a signal or by a tracer.
    Stopped,
    Paging,
    Unknown(char),
}

impl ProcessState {
    fn from_char(c: char) -> Self {
        match c {
            'R' => Self::Running,
            'S' => Self::Sleeping,
            'D' => Self::Waiting,
            'Z' => Self::Zombie,
            // `t` is the tracing stop reported by kernels >= 2.6.33.
            'T' | 't' => Self::Stopped,
            'W' => Self::Paging,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Sleeping => "Sleeping",
            Self::Waiting => "Waiting",
            Self::Zombie => "Zombie",
            Self::Stopped => "Traced/Stopped",
            Self::Paging => "Paging",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed `/proc/<pid>/stat` record.
///
/// Field names follow the kernel's stat layout; see proc(5). Times are
/// clock ticks, sizes are bytes unless noted.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub pid: Pid,
    /// Executable name, at most [`COMM_LEN`] bytes.
    pub comm: String,
    pub state: char,
    pub ppid: Pid,
    pub pgrp: Pid,
    pub session: Pid,
    /// Packed controlling-terminal device number; see [`Self::tty_nr`].
    pub tty_nr: i32,
    pub tpgid: Pid,
    pub flags: u32,
    pub minflt: u64,
    pub cminflt: u64,
    pub majflt: u64,
    pub cmajflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
    /// Start time in ticks since boot.
    pub starttime: u64,
    pub vsize: u64,
    /// Resident set size in pages.
    pub rss: i64,
    pub rsslim: u64,
    pub startcode: usize,
    pub endcode: usize,
    pub startstack: usize,
    pub kstkesp: usize,
    pub kstkeip: usize,
    pub wchan: u64,
    pub exit_signal: i32,
    /// CPU number last executed on.
    pub processor: i32,
    pub rt_priority: u32,
    pub policy: u32,
    pub delayacct_blkio_ticks: u64,
    pub guest_time: u64,
    pub cguest_time: i64,
}

impl ProcessStatus {
    /// Parses one stat line.
    ///
    /// The executable name is delimited by the first `(` and the last
    /// `)`, since the name may itself contain whitespace and right
    /// parens. Unused positions are consumed so field alignment is
    /// preserved.
    pub fn parse(line: &str) -> Result<Self> {
        let open = line.find('(').ok_or_else(malformed)?;
        let close = line.rfind(')').ok_or_else(malformed)?;
        if close < open {
            return Err(malformed());
        }

        let pid = line[..open]
            .trim()
            .parse::<i32>()
            .map(Pid::from_raw)
            .map_err(|_| malformed())?;
        let comm = line[open + 1..close].to_owned();

        let mut fields = Fields(line[close + 1..].split_ascii_whitespace());

        let status = Self {
            pid,
            comm,
            state: fields.next()?,
            ppid: Pid::from_raw(fields.next()?),
            pgrp: Pid::from_raw(fields.next()?),
            session: Pid::from_raw(fields.next()?),
            tty_nr: fields.next()?,
            tpgid: Pid::from_raw(fields.next()?),
            flags: fields.next()?,
            minflt: fields.next()?,
            cminflt: fields.next()?,
            majflt: fields.next()?,
            cmajflt: fields.next()?,
            utime: fields.next()?,
            stime: fields.next()?,
            cutime: fields.next()?,
            cstime: fields.next()?,
            priority: fields.next()?,
            nice: fields.next()?,
            num_threads: fields.next()?,
            starttime: {
                fields.skip()?; // itrealvalue
                fields.next()?
            },
            vsize: fields.next()?,
            rss: fields.next()?,
            rsslim: fields.next()?,
            startcode: fields.next()?,
            endcode: fields.next()?,
            startstack: fields.next()?,
            kstkesp: fields.next()?,
            kstkeip: fields.next()?,
            wchan: {
                // signal, blocked, sigignore, sigcatch: obsolete masks
                for _ in 0..4 {
                    fields.skip()?;
                }
                fields.next()?
            },
            exit_signal: {
                fields.skip()?; // nswap
                fields.skip()?; // cnswap
                fields.next()?
            },
            processor: fields.next()?,
            rt_priority: fields.next()?,
            policy: fields.next()?,
            delayacct_blkio_ticks: fields.next()?,
            guest_time: fields.next()?,
            cguest_time: fields.next()?,
        };

        Ok(status)
    }

    /// The run state the state character encodes.
    pub fn state(&self) -> ProcessState {
        ProcessState::from_char(self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn is_sleeping(&self) -> bool {
        self.state() == ProcessState::Sleeping
    }

    pub fn is_waiting(&self) -> bool {
        self.state() == ProcessState::Waiting
    }

    pub fn is_zombie(&self) -> bool {
        self.state() == ProcessState::Zombie
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ProcessState::Stopped
    }

    pub fn is_paging(&self) -> bool {
        self.state() == ProcessState::Paging
    }

    /// Controlling terminal as `(major, minor)` device numbers.
    ///
    /// The kernel packs the device number as `(major << 8) |
    /// (minor & 0xff) | (extra_minor << 20)`.
    pub fn tty_nr(&self) -> (u32, u32) {
        let tty = self.tty_nr as u32;
        let major = (tty >> 8) & 0xfff;
        let minor = (tty & 0xff) | ((tty >> 20) << 8);
        (major, minor)
    }
}

fn malformed() -> Error {
    Error::Unexpected("malformed stat record".into())
}

struct Fields<'a>(std::str::SplitAsciiWhitespace<'a>);

impl Fields<'_> {
    fn next<T: FromStr>(&mut self) -> Result<T> {
        self.0
            .next()
            .and_then(|tok| tok.parse().ok())
            .ok_or_else(malformed)
    }

    fn skip(&mut self) -> Result<()> {
        self.0.next().map(|_| ()).ok_or_else(malformed)
    }
}

/// Iterates the running processes on the system.
///
/// Single-pass: entries are read from `/proc` as the iterator advances,
/// so a process may vanish between the directory walk and a later
/// `status()` call.
pub fn processes() -> Result<Processes> {
    Processes::in_dir(Path::new(PROC_ROOT))
}

/// Iterator over `/proc`, admitting only all-digit entry names.
pub struct Processes {
    inner: fs::ReadDir,
}

impl Processes {
    fn in_dir(dir: &Path) -> Result<Self> {
        let inner = fs::read_dir(dir).map_err(|e| Error::File(dir.to_path_buf(), e))?;
        Ok(Self { inner })
    }
}

impl Iterator for Processes {
    type Item = Result<Process>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(entry) => {
                    let name = entry.file_name();
                    match name.to_str() {
                        Some(name) if is_numeric(name) => {
                            return Some(Process::from_procfs_path(&entry.path()));
                        }
                        _ => continue,
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// First process whose executable name matches, if any.
///
/// Only the first [`COMM_LEN`] bytes of `name` take part in the
/// comparison, mirroring the kernel's truncation of the stat name
/// field.
pub fn process_by_name(name: &str) -> Result<Option<Process>> {
    let needle = truncate_comm(name);

    for process in processes()? {
        let process = process?;
        let Ok(status) = process.status() else {
            // process vanished mid-walk
            continue;
        };

        if status.comm == needle {
            return Ok(Some(process));
        }
    }

    Ok(None)
}

/// All processes whose executable name matches.
pub fn processes_by_name(name: &str) -> Result<Vec<Process>> {
    let needle = truncate_comm(name);
    let mut found = Vec::new();

    for process in processes()? {
        let process = process?;
        let Ok(status) = process.status() else {
            continue;
        };

        if status.comm == needle {
            found.push(process);
        }
    }

    Ok(found)
}

fn is_numeric(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

fn truncate_comm(name: &str) -> &str {
    if name.len() <= COMM_LEN {
        return name;
    }

    let mut end = COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_line(pid: i32, comm: &str, state: char, tail: &str) -> String {
        format!("{pid} ({comm}) {state} {tail}")
    }

    // ppid pgrp session tty tpgid flags minflt cminflt majflt cmajflt
    // utime stime cutime cstime priority nice threads itreal starttime
    // vsize rss rsslim startcode endcode startstack kstkesp kstkeip
    // signal blocked sigignore sigcatch wchan nswap cnswap exit_signal
    // processor rt_priority policy blkio guest cguest
    const PLAIN_TAIL: &str =
        "1 2 3 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 100 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 0 99 0 0 0";

    #[test]
    fn parses_full_record() {
        let line = stat_line(42, "my app", 'S', "1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 100 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 0 99 0 0 0");
        let status = ProcessStatus::parse(&line).unwrap();

        assert_eq!(status.pid, Pid::from_raw(42));
        assert_eq!(status.comm, "my app");
        assert_eq!(status.state(), ProcessState::Sleeping);
        assert_eq!(status.ppid, Pid::from_raw(1));
        assert_eq!(status.pgrp, Pid::from_raw(42));
        assert_eq!(status.session, Pid::from_raw(42));
        assert_eq!(status.priority, 20);
        assert_eq!(status.nice, 0);
        assert_eq!(status.num_threads, 1);
        assert_eq!(status.starttime, 100);
        assert_eq!(status.processor, 17);
        assert_eq!(status.rt_priority, 0);
        assert_eq!(status.policy, 99);
    }

    #[test]
    fn name_may_contain_whitespace_and_parens() {
        let line = stat_line(7, "evil) (name", 'R', PLAIN_TAIL);
        let status = ProcessStatus::parse(&line).unwrap();

        assert_eq!(status.comm, "evil) (name");
        assert_eq!(status.state(), ProcessState::Running);
        assert_eq!(status.ppid, Pid::from_raw(1));
    }

    #[test]
    fn state_predicates_are_mutually_exclusive() {
        for (c, expected) in [
            ('R', ProcessState::Running),
            ('S', ProcessState::Sleeping),
            ('D', ProcessState::Waiting),
            ('Z', ProcessState::Zombie),
            ('T', ProcessState::Stopped),
            ('t', ProcessState::Stopped),
            ('W', ProcessState::Paging),
            ('X', ProcessState::Unknown('X')),
        ] {
            let line = stat_line(1, "init", c, PLAIN_TAIL);
            let status = ProcessStatus::parse(&line).unwrap();
            assert_eq!(status.state(), expected);

            let predicates = [
                status.is_running(),
                status.is_sleeping(),
                status.is_waiting(),
                status.is_zombie(),
                status.is_stopped(),
                status.is_paging(),
            ];
            let hits = predicates.iter().filter(|&&p| p).count();
            assert!(hits <= 1, "state {c:?} sets {hits} predicates");
        }
    }

    #[test]
    fn state_names_are_human_readable() {
        assert_eq!(ProcessState::Running.to_string(), "Running");
        assert_eq!(ProcessState::Stopped.as_str(), "Traced/Stopped");
        assert_eq!(ProcessState::Unknown('q').as_str(), "Unknown");
    }

    #[test]
    fn decodes_packed_tty_device_number() {
        let mut line = stat_line(1, "sh", 'S', PLAIN_TAIL);
        let status = ProcessStatus::parse(&line).unwrap();
        assert_eq!(status.tty_nr(), (0, 0));

        // major 4, minor 2 (tty2)
        line = stat_line(1, "sh", 'S', &PLAIN_TAIL.replacen(" 0 -1", " 1026 -1", 1));
        let status = ProcessStatus::parse(&line).unwrap();
        assert_eq!(status.tty_nr(), (4, 2));

        // major 136, minor 261: low 8 bits plus the extra-minor bits
        let packed = (136 << 8) | 5 | (1 << 20);
        line = stat_line(
            1,
            "sh",
            'S',
            &PLAIN_TAIL.replacen(" 0 -1", &format!(" {packed} -1"), 1),
        );
        let status = ProcessStatus::parse(&line).unwrap();
        assert_eq!(status.tty_nr(), (136, 261));
    }

    #[test]
    fn rejects_truncated_records() {
        assert!(ProcessStatus::parse("").is_err());
        assert!(ProcessStatus::parse("42 (a) S 1 2").is_err());
        assert!(ProcessStatus::parse("42 no-parens S").is_err());
    }

    #[test]
    fn parses_the_live_stat_record() {
        let me = Process::current().unwrap();
        let status = me.status().unwrap();

        assert_eq!(status.pid, me.pid());
        // this thread is on a CPU right now
        assert!(status.is_running());
        assert!(status.num_threads >= 1);
        assert!(!status.comm.is_empty() && status.comm.len() <= COMM_LEN);
    }

    #[test]
    fn open_validates_the_procfs_directory() {
        let me = Process::current().unwrap();
        assert_eq!(me.pid(), nix::unistd::getpid());

        // pid 0 has no /proc entry
        assert!(matches!(
            Process::open(Pid::from_raw(0)),
            Err(Error::NoProcess(_))
        ));
    }

    #[test]
    fn equality_is_by_pid() {
        let a = Process::current().unwrap();
        let b = Process::open(a.pid()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn procfs_path_must_be_numeric() {
        assert!(Process::from_procfs_path(Path::new("/proc/self")).is_err());
        assert!(Process::from_procfs_path(Path::new("/proc")).is_err());
    }

    #[test]
    fn executable_path_resolves_the_exe_link() {
        let me = Process::current().unwrap();
        let exe = me.executable_path().unwrap();
        assert_eq!(exe, std::env::current_exe().unwrap());
    }

    #[test]
    fn iterator_admits_only_numeric_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1", "22", "333", "not-a-pid", "4a4"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }

        let mut pids: Vec<i32> = Processes::in_dir(dir.path())
            .unwrap()
            .map(|p| p.unwrap().pid().as_raw())
            .collect();
        pids.sort_unstable();

        assert_eq!(pids, vec![1, 22, 333]);
    }

    #[test]
    fn empty_directory_yields_an_exhausted_iterator() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Processes::in_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn enumeration_includes_the_current_process() {
        let me = nix::unistd::getpid();
        assert!(processes()
            .unwrap()
            .filter_map(|p| p.ok())
            .any(|p| p.pid() == me));
    }

    #[test]
    fn lookup_by_name_truncates_the_needle() {
        let comm = Process::current().unwrap().status().unwrap().comm;

        // The padded needle shares its first 15 bytes with the real name.
        let padded = format!("{comm}-with-a-very-long-suffix");
        let needle = if comm.len() >= COMM_LEN { &padded } else { &comm };

        let found = process_by_name(needle).unwrap();
        assert!(found.is_some());

        let all = processes_by_name(needle).unwrap();
        assert!(all.iter().any(|p| p.pid() == nix::unistd::getpid()));
    }
}
