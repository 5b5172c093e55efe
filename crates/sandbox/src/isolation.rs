//! Isolation backend: filesystem allow-lists, resource ceilings, network-off.
//!
//! Restrictions are installed in the child between fork and exec. The parent
//! probes backend availability first; if a spec asks for isolation that the
//! host cannot provide, execution fails with a sandbox error rather than
//! running the child unrestricted.

use std::process::Command;

use conveyor_core::{Error, Result};

use crate::spec::SandboxSpec;

/// Verify the isolation backend can serve this spec. Called in the parent,
/// before spawning; a failure here is fatal for the whole task.
pub fn probe(spec: &SandboxSpec) -> Result<()> {
    if !spec.wants_isolation() {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        if spec.restrict_filesystem {
            linux::probe_landlock()?;
        }
        if !spec.allow_network {
            linux::probe_namespaces()?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(Error::sandbox_unavailable(
            "process isolation is only supported on Linux",
        ))
    }
}

/// Install the spec's restrictions on a command about to be spawned.
///
/// Must be called after `probe` succeeded. The closures run post-fork in the
/// child, so failures surface as spawn errors.
pub fn apply(cmd: &mut Command, spec: &SandboxSpec) -> Result<()> {
    if !spec.wants_isolation() {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        linux::apply(cmd, spec);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = cmd;
        Err(Error::sandbox_unavailable(
            "process isolation is only supported on Linux",
        ))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::process::CommandExt;
    use std::path::PathBuf;
    use std::process::Command;

    use landlock::{
        Access, AccessFs, Ruleset, RulesetAttr, RulesetCreatedAttr, RulesetStatus, ABI,
    };

    use conveyor_core::{Error, Result};

    use crate::spec::SandboxSpec;

    const LANDLOCK_ABI: ABI = ABI::V2;

    /// Creating (without enforcing) a ruleset tells us whether the kernel
    /// supports landlock at all.
    pub(super) fn probe_landlock() -> Result<()> {
        Ruleset::default()
            .handle_access(AccessFs::from_all(LANDLOCK_ABI))
            .and_then(|r| r.create())
            .map(|_| ())
            .map_err(|e| {
                Error::sandbox_unavailable(format!("landlock ruleset creation failed: {e}"))
            })
    }

    /// Unprivileged user namespaces gate network isolation. Hosts restrict
    /// them through either sysctl knob; a missing knob means no restriction.
    pub(super) fn probe_namespaces() -> Result<()> {
        check_userns_knobs(
            std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone").ok(),
            std::fs::read_to_string("/proc/sys/user/max_user_namespaces").ok(),
        )
    }

    pub(super) fn check_userns_knobs(
        unprivileged_clone: Option<String>,
        max_user_namespaces: Option<String>,
    ) -> Result<()> {
        if unprivileged_clone.is_some_and(|v| v.trim() == "0") {
            return Err(Error::sandbox_unavailable(
                "unprivileged user namespaces are disabled on this host",
            ));
        }
        if max_user_namespaces.is_some_and(|v| v.trim() == "0") {
            return Err(Error::sandbox_unavailable(
                "user namespace creation is disabled (max_user_namespaces is 0)",
            ));
        }
        Ok(())
    }

    pub(super) fn apply(cmd: &mut Command, spec: &SandboxSpec) {
        let restrict_filesystem = spec.restrict_filesystem;
        let disable_network = !spec.allow_network;
        let cpu_secs = spec.cpu_secs;
        let memory_bytes = spec.memory_bytes;
        let read_only: Vec<PathBuf> = spec.read_only_paths.clone();
        let read_write: Vec<PathBuf> = spec.read_write_paths.clone();

        // Runs in the forked child, before exec. Any error aborts the spawn.
        unsafe {
            cmd.pre_exec(move || {
                if disable_network {
                    unshare_network()?;
                }
                apply_rlimits(cpu_secs, memory_bytes)?;
                if restrict_filesystem {
                    enforce_landlock(&read_only, &read_write)?;
                }
                Ok(())
            });
        }
    }

    fn io_err(message: String) -> std::io::Error {
        std::io::Error::other(message)
    }

    /// New user + network namespace: the child keeps only a loopback-less,
    /// interface-less network view.
    fn unshare_network() -> std::io::Result<()> {
        use nix::sched::{unshare, CloneFlags};

        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();

        unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)
            .map_err(|e| io_err(format!("unshare failed: {e}")))?;

        // Map ourselves so the child still runs under a usable uid
        std::fs::write("/proc/self/uid_map", format!("{uid} {uid} 1"))?;
        std::fs::write("/proc/self/setgroups", "deny")?;
        std::fs::write("/proc/self/gid_map", format!("{gid} {gid} 1"))?;

        Ok(())
    }

    fn apply_rlimits(cpu_secs: Option<u64>, memory_bytes: Option<u64>) -> std::io::Result<()> {
        if let Some(secs) = cpu_secs {
            set_rlimit(libc::RLIMIT_CPU, secs)?;
        }
        if let Some(bytes) = memory_bytes {
            set_rlimit(libc::RLIMIT_AS, bytes)?;
        }
        Ok(())
    }

    fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        // SAFETY: limit is a valid, initialized rlimit struct
        let rc = unsafe { libc::setrlimit(resource, &limit) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn enforce_landlock(read_only: &[PathBuf], read_write: &[PathBuf]) -> std::io::Result<()> {
        let status = Ruleset::default()
            .handle_access(AccessFs::from_all(LANDLOCK_ABI))
            .and_then(|r| r.create())
            .and_then(|r| {
                r.add_rules(landlock::path_beneath_rules(
                    read_only,
                    AccessFs::from_read(LANDLOCK_ABI),
                ))
            })
            .and_then(|r| {
                r.add_rules(landlock::path_beneath_rules(
                    read_write,
                    AccessFs::from_all(LANDLOCK_ABI),
                ))
            })
            .and_then(|r| r.restrict_self())
            .map_err(|e| io_err(format!("landlock restriction failed: {e}")))?;

        if status.ruleset == RulesetStatus::NotEnforced {
            return Err(io_err(
                "landlock is not enforced by this kernel".to_string(),
            ));
        }
        Ok(())
    }
}
