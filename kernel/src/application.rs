// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Application descriptor: an executable launched by the daemon and
//! identified by a cluster-wide 64-bit id.

use crate::buffer::KernelBuffer;
use crate::errors::KernelError;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Application id of every daemon process. Id 0 means "unassigned".
pub const DAEMON_APPLICATION_ID: u64 = 1;

/// Environment variables a spawned application inherits from the daemon.
pub const ENV_INPUT_FD: &str = "ARBOR_INPUT_FD";
pub const ENV_OUTPUT_FD: &str = "ARBOR_OUTPUT_FD";
pub const ENV_APPLICATION_ID: &str = "ARBOR_APPLICATION_ID";

static THIS_APPLICATION_ID: OnceLock<u64> = OnceLock::new();

/// Application id of the current process: the value of
/// [`ENV_APPLICATION_ID`] when launched by a daemon, the daemon id
/// otherwise. Resolved once.
pub fn this_application_id() -> u64 {
    *THIS_APPLICATION_ID.get_or_init(|| {
        std::env::var(ENV_APPLICATION_ID)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|id| *id != 0)
            .unwrap_or(DAEMON_APPLICATION_ID)
    })
}

/// Generate a random non-zero application id.
pub fn generate_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 && id != DAEMON_APPLICATION_ID {
            return id;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Application {
    id: u64,
    uid: u32,
    gid: u32,
    argv: Vec<String>,
    envp: Vec<String>,
    working_directory: PathBuf,
    wait_for_completion: bool,
}

impl Application {
    pub fn new(argv: Vec<String>) -> Self {
        Self { id: generate_id(), argv, ..Self::default() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn set_credentials(&mut self, uid: u32, gid: u32) {
        self.uid = uid;
        self.gid = gid;
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The executable path, if any arguments were given at all.
    pub fn executable(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn envp(&self) -> &[String] {
        &self.envp
    }

    pub fn set_envp(&mut self, envp: Vec<String>) {
        self.envp = envp;
    }

    pub fn working_directory(&self) -> &PathBuf {
        &self.working_directory
    }

    pub fn set_working_directory(&mut self, dir: PathBuf) {
        self.working_directory = dir;
    }

    pub fn wait_for_completion(&self) -> bool {
        self.wait_for_completion
    }

    pub fn set_wait_for_completion(&mut self, wait: bool) {
        self.wait_for_completion = wait;
    }

    pub fn write(&self, out: &mut KernelBuffer) {
        out.write_u64(self.id);
        out.write_u32(self.uid);
        out.write_u32(self.gid);
        out.write_u32(self.argv.len() as u32);
        for arg in &self.argv {
            out.write_str(arg);
        }
        out.write_u32(self.envp.len() as u32);
        for env in &self.envp {
            out.write_str(env);
        }
        out.write_str(&self.working_directory.to_string_lossy());
        out.write_bool(self.wait_for_completion);
    }

    pub fn read(buf: &mut KernelBuffer) -> Result<Self, KernelError> {
        let id = buf.read_u64()?;
        let uid = buf.read_u32()?;
        let gid = buf.read_u32()?;
        let argc = buf.read_u32()? as usize;
        let mut argv = Vec::with_capacity(argc.min(256));
        for _ in 0..argc {
            argv.push(buf.read_string()?);
        }
        let envc = buf.read_u32()? as usize;
        let mut envp = Vec::with_capacity(envc.min(256));
        for _ in 0..envc {
            envp.push(buf.read_string()?);
        }
        let working_directory = PathBuf::from(buf.read_string()?);
        let wait_for_completion = buf.read_bool()?;
        Ok(Self { id, uid, gid, argv, envp, working_directory, wait_for_completion })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn generated_ids_are_nonzero() {
        for _ in 0..64 {
            let id = generate_id();
            assert_ne!(id, 0);
            assert_ne!(id, DAEMON_APPLICATION_ID);
        }
    }

    #[test]
    fn wire_round_trip() {
        let mut app = Application::new(vec!["/usr/bin/hello".into(), "10".into()]);
        app.set_credentials(1000, 1000);
        app.set_envp(vec!["LANG=C".into()]);
        app.set_working_directory(PathBuf::from("/var/tmp"));
        app.set_wait_for_completion(true);

        let mut buf = KernelBuffer::new();
        app.write(&mut buf);
        let restored = Application::read(&mut buf).unwrap();
        assert_eq!(restored, app);
    }
}
