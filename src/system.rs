use std::fmt;
use std::io;

/// What the daemon needs to know about the machine it runs on.
pub trait SystemProbe: Send + Sync + fmt::Debug {
    /// The 1, 5 and 15 minute load averages.
    fn load_average(&self) -> [f64; 3];

    /// Number of interactive login sessions.
    fn interactive_users(&self) -> io::Result<usize>;
}

/// The machine we are running on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Host;

impl SystemProbe for Host {
    fn load_average(&self) -> [f64; 3] {
        let load = sysinfo::System::load_average();
        [load.one, load.five, load.fifteen]
    }

    fn interactive_users(&self) -> io::Result<usize> {
        utmp::interactive_sessions()
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod utmp {
    use std::io;
    use std::path::Path;

    use parking_lot::{const_mutex, Mutex};

    // the utmpx cursor is process-global
    static CURSOR: Mutex<()> = const_mutex(());

    /// Count user sessions whose terminal still exists.
    pub(super) fn interactive_sessions() -> io::Result<usize> {
        let _guard = CURSOR.lock();
        let mut n = 0;
        // SAFETY: access to the utmpx cursor is serialized by CURSOR, and each entry is only read
        // before the next call to getutxent.
        unsafe {
            libc::setutxent();
            loop {
                let entry = libc::getutxent();
                if entry.is_null() {
                    break;
                }
                let entry = &*entry;
                if entry.ut_type != libc::USER_PROCESS {
                    continue;
                }
                let line = &entry.ut_line;
                let len = line.iter().position(|&c| c == 0).unwrap_or(line.len());
                let bytes: Vec<u8> = line[..len].iter().map(|&c| c as u8).collect();
                let line = String::from_utf8_lossy(&bytes);
                if !line.is_empty() && Path::new("/dev").join(&*line).exists() {
                    n += 1;
                }
            }
            libc::endutxent();
        }
        Ok(n)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod utmp {
    use std::io;

    pub(super) fn interactive_sessions() -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no utmpx database on this platform",
        ))
    }
}

/// A machine whose state is whatever the test says it is.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct FixedProbe {
    pub(crate) load: [f64; 3],
    pub(crate) users: Option<usize>,
}

#[cfg(test)]
impl SystemProbe for FixedProbe {
    fn load_average(&self) -> [f64; 3] {
        self.load
    }

    fn interactive_users(&self) -> io::Result<usize> {
        self.users
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no utmp"))
    }
}

#[test]
fn host_load_is_sane() {
    let load = Host.load_average();
    assert!(load.iter().all(|l| *l >= 0.0));
}
