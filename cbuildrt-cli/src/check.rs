//! Host preflight check

use anyhow::Result;
use cbuildrt_namespace::NamespaceInfo;
use std::fs;
use std::path::Path;

const MAX_USER_NAMESPACES: &str = "/proc/sys/user/max_user_namespaces";
const UNPRIVILEGED_USERNS_CLONE: &str = "/proc/sys/kernel/unprivileged_userns_clone";
const APPARMOR_RESTRICT_USERNS: &str = "/proc/sys/kernel/apparmor_restrict_unprivileged_userns";

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Ok(String),
    Warn(String),
    Fail(String),
}

impl Status {
    const fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    fn print(&self) {
        match self {
            Self::Ok(detail) => println!("✅ OK ({detail})"),
            Self::Warn(detail) => println!("⚠️  {detail}"),
            Self::Fail(detail) => println!("❌ {detail}"),
        }
    }
}

/// Execute the preflight check; returns the process exit status
pub fn execute() -> Result<i32> {
    println!("\n🏥 cbuildrt host check\n");
    println!("{:-<60}", "");

    let checks = [
        ("namespace support", check_namespace_support()),
        ("user namespace limit", check_max_user_namespaces(Path::new(MAX_USER_NAMESPACES))),
        (
            "unprivileged user namespaces",
            check_unprivileged_clone(Path::new(UNPRIVILEGED_USERNS_CLONE)),
        ),
        ("AppArmor restriction", check_apparmor(Path::new(APPARMOR_RESTRICT_USERNS))),
    ];

    let mut failed = false;
    for (name, status) in &checks {
        print!("Checking {name}... ");
        status.print();
        failed |= status.is_fail();
    }

    println!("{:-<60}", "");
    if failed {
        println!("\n❌ Unprivileged runs are not possible on this host\n");
        Ok(1)
    } else {
        println!("\n✅ Host is ready for cbuildrt\n");
        Ok(0)
    }
}

fn check_namespace_support() -> Status {
    let info = NamespaceInfo::current();
    let available = info.available();
    let missing: Vec<_> = ["user", "mnt", "pid"]
        .into_iter()
        .filter(|ns| !available.contains(ns))
        .collect();

    if missing.is_empty() {
        Status::Ok(available.join(", "))
    } else {
        Status::Fail(format!("missing: {}", missing.join(", ")))
    }
}

fn check_max_user_namespaces(path: &Path) -> Status {
    match read_sysctl(path) {
        Some(0) => Status::Fail(format!("{} is 0", path.display())),
        Some(limit) => Status::Ok(format!("limit {limit}")),
        None => Status::Warn(format!("{} not readable", path.display())),
    }
}

// Only exists on kernels carrying the Debian patch
fn check_unprivileged_clone(path: &Path) -> Status {
    match read_sysctl(path) {
        Some(0) => Status::Fail(format!("disabled by {}", path.display())),
        Some(_) => Status::Ok("enabled".to_string()),
        None => Status::Ok("no restriction".to_string()),
    }
}

fn check_apparmor(path: &Path) -> Status {
    match read_sysctl(path) {
        Some(0) | None => Status::Ok("not restricted".to_string()),
        Some(_) => Status::Warn(format!(
            "{} is set; an AppArmor profile may be needed",
            path.display()
        )),
    }
}

fn read_sysctl(path: &Path) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sysctl(value: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), format!("{value}\n")).unwrap();
        file
    }

    #[test]
    fn test_user_namespace_limit() {
        assert!(check_max_user_namespaces(sysctl("0").path()).is_fail());
        assert_eq!(
            check_max_user_namespaces(sysctl("63479").path()),
            Status::Ok("limit 63479".to_string())
        );
    }

    #[test]
    fn test_missing_sysctls_are_not_failures() {
        let missing = Path::new("/nonexistent/cbuildrt/sysctl");
        assert!(!check_unprivileged_clone(missing).is_fail());
        assert!(!check_apparmor(missing).is_fail());
        assert!(matches!(check_max_user_namespaces(missing), Status::Warn(_)));
    }

    #[test]
    fn test_unprivileged_clone_disabled() {
        assert!(check_unprivileged_clone(sysctl("0").path()).is_fail());
        assert!(!check_unprivileged_clone(sysctl("1").path()).is_fail());
    }

    #[test]
    fn test_apparmor_restriction_warns() {
        assert!(matches!(check_apparmor(sysctl("1").path()), Status::Warn(_)));
    }
}
