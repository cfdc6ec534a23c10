use std::path::Path;
use std::path::PathBuf;

use tracing::trace;

use super::ProcessDetails;
use super::ProcessInspector;

const MAX_CMDLINE_CHARS: usize = 64;
const CONTAINER_ID_LEN: usize = 64;
const RUNTIME_PREFIXES: [&str; 4] = ["docker-", "cri-containerd-", "crio-", "libpod-"];

/// Reads process facts from a procfs tree.
///
/// The root is configurable so the inspector can look at the host's
/// `/proc` from inside a container (`/host/proc`) and at fake trees in tests.
/// User names are resolved through `<root>/../etc/passwd`.
#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    proc_root: PathBuf,
    passwd_path: PathBuf,
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsInspector {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        let proc_root = proc_root.into();
        let passwd_path = proc_root
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .join("etc/passwd");
        Self {
            proc_root,
            passwd_path,
        }
    }

    fn read(&self, pid: u32, file: &str) -> Option<Vec<u8>> {
        let path = self.proc_root.join(pid.to_string()).join(file);
        match std::fs::read(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                trace!(pid, path = %path.display(), "failed to read: {e}");
                None
            }
        }
    }

    fn user(&self, pid: u32) -> Option<String> {
        let status = self.read(pid, "status")?;
        let uid = parse_uid(&String::from_utf8_lossy(&status))?;
        let name = std::fs::read_to_string(&self.passwd_path)
            .ok()
            .and_then(|passwd| lookup_user(&passwd, uid));
        Some(name.unwrap_or_else(|| uid.to_string()))
    }
}

impl ProcessInspector for ProcfsInspector {
    fn inspect(&self, pid: u32) -> ProcessDetails {
        ProcessDetails {
            user: self.user(pid).unwrap_or_default(),
            short_cmdline: self
                .read(pid, "cmdline")
                .map(|raw| shorten_cmdline(&raw))
                .unwrap_or_default(),
            container_id: self
                .read(pid, "cgroup")
                .and_then(|raw| parse_container_id(&String::from_utf8_lossy(&raw))),
        }
    }
}

/// Joins the NUL separated arguments, keeps only the executable's file name
/// and caps the result at 64 characters.
pub fn shorten_cmdline(raw: &[u8]) -> String {
    let raw = String::from_utf8_lossy(raw);
    let mut args = raw.split('\0').filter(|arg| !arg.is_empty());
    let Some(program) = args.next() else {
        return String::new();
    };
    let program = Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());

    let joined = std::iter::once(program)
        .chain(args.map(str::to_string))
        .collect::<Vec<_>>()
        .join(" ");

    if joined.chars().count() <= MAX_CMDLINE_CHARS {
        return joined;
    }
    let mut short: String = joined.chars().take(MAX_CMDLINE_CHARS - 3).collect();
    short.push_str("...");
    short
}

/// Extracts the container id from the content of `/proc/<pid>/cgroup`.
///
/// Handles both cgroup v1 (`/kubepods/.../<id>`) and systemd driven v2
/// paths (`.../cri-containerd-<id>.scope`).
pub fn parse_container_id(cgroup: &str) -> Option<String> {
    cgroup.lines().find_map(|line| {
        let path = line.splitn(3, ':').nth(2)?;
        let segment = path.rsplit('/').next()?;
        let segment = segment.strip_suffix(".scope").unwrap_or(segment);
        let id = RUNTIME_PREFIXES
            .iter()
            .find_map(|prefix| segment.strip_prefix(prefix))
            .unwrap_or(segment);
        (id.len() == CONTAINER_ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| id.to_ascii_lowercase())
    })
}

fn parse_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

fn lookup_user(passwd: &str, uid: u32) -> Option<String> {
    passwd.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let entry_uid = fields.nth(1)?.parse::<u32>().ok()?;
        (entry_uid == uid).then(|| name.to_string())
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;

    use super::*;

    const ID: &str = "3f4e2b8c9a1d7e6f5b4a3c2d1e0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d3e2f";

    #[test]
    fn container_id_from_cgroup_v1() {
        let cgroup = format!(
            "12:memory:/kubepods/burstable/pod5e1a/{ID}\n11:cpu,cpuacct:/kubepods/burstable/pod5e1a/{ID}\n"
        );

        assert_eq!(parse_container_id(&cgroup), Some(ID.to_string()));
    }

    #[test]
    fn container_id_from_systemd_cgroup_v2() {
        let cgroup = format!(
            "0::/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod5e1a.slice/cri-containerd-{ID}.scope\n"
        );

        assert_eq!(parse_container_id(&cgroup), Some(ID.to_string()));
    }

    #[test]
    fn host_process_has_no_container_id() {
        let cgroup = "0::/user.slice/user-1000.slice/session-2.scope\n";

        assert_eq!(parse_container_id(cgroup), None);
    }

    #[test]
    fn short_cmdline_keeps_program_file_name() {
        let raw = b"/usr/bin/python3\0train.py\0--epochs\x0010\0";

        assert_eq!(shorten_cmdline(raw), "python3 train.py --epochs 10");
    }

    #[test]
    fn long_cmdline_is_truncated() {
        let raw = format!("/opt/conda/bin/python\0{}\0", "x".repeat(100));

        let short = shorten_cmdline(raw.as_bytes());

        assert_eq!(short.chars().count(), 64);
        assert!(short.starts_with("python xxx"), "got {short}");
        assert!(short.ends_with("..."), "got {short}");
    }

    #[test]
    fn empty_cmdline_stays_empty() {
        assert_eq!(shorten_cmdline(b""), "");
    }

    #[test]
    fn inspect_reads_fake_proc_tree() {
        // Arrange
        let root = tempfile::tempdir().expect("should create temp dir");
        let proc_dir = root.path().join("proc/4242");
        fs::create_dir_all(&proc_dir).expect("should create proc dir");
        fs::create_dir_all(root.path().join("etc")).expect("should create etc");
        fs::write(proc_dir.join("cmdline"), b"/usr/bin/python3\0serve.py\0").expect("write");
        fs::write(
            proc_dir.join("status"),
            "Name:\tpython3\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n",
        )
        .expect("write");
        fs::write(proc_dir.join("cgroup"), format!("0::/docker-{ID}.scope\n")).expect("write");
        fs::write(
            root.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\ntrainer:x:1000:1000::/home/trainer:/bin/sh\n",
        )
        .expect("write");
        let inspector = ProcfsInspector::new(root.path().join("proc"));

        // Act
        let details = inspector.inspect(4242);

        // Assert
        assert_eq!(
            details,
            ProcessDetails {
                user: "trainer".to_string(),
                short_cmdline: "python3 serve.py".to_string(),
                container_id: Some(ID.to_string()),
            }
        );
    }

    #[test]
    fn inspect_of_vanished_process_is_empty() {
        let root = tempfile::tempdir().expect("should create temp dir");
        let inspector = ProcfsInspector::new(root.path().join("proc"));

        let details = inspector.inspect(1);

        assert_eq!(details, ProcessDetails::default());
    }

    #[test]
    fn unknown_uid_falls_back_to_number() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\n";

        assert_eq!(lookup_user(passwd, 0), Some("root".to_string()));
        assert_eq!(lookup_user(passwd, 1000), None);
        assert_eq!(parse_uid("Uid:\t1000\t1000\t1000\t1000\n"), Some(1000));
    }
}
