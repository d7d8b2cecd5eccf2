//! NEEDED-library resolution
//!
//! The base set is derived from what the program actually uses: libc
//! always, libpthread when parallel loops occur, libm when `c.` math
//! symbols are imported. User `import foo as f` declarations resolve
//! through `pkg-config`, falling back to an `ldconfig -p` scan for the
//! versioned soname; when both miss, the library cannot be resolved and
//! the caller decides whether that is fatal (an unresolvable NEEDED
//! entry would only fail later, at load time).

use crate::error::{ObjectError, ObjectResult};
use log::debug;
use std::process::Command;

pub const LIBC: &str = "libc.so.6";
pub const LIBPTHREAD: &str = "libpthread.so.0";
pub const LIBM: &str = "libm.so.6";

/// Compute the NEEDED list in deterministic order.
pub fn needed_libraries(
    uses_parallel: bool,
    uses_libm: bool,
    user_imports: &[String],
) -> ObjectResult<Vec<String>> {
    let mut libs = vec![LIBC.to_string()];
    if uses_parallel {
        libs.push(LIBPTHREAD.to_string());
    }
    if uses_libm {
        libs.push(LIBM.to_string());
    }
    for lib in user_imports {
        let soname = resolve_soname(lib)?;
        if !libs.contains(&soname) {
            libs.push(soname);
        }
    }
    Ok(libs)
}

/// Resolve a library name (`sdl3`) to a soname the loader accepts.
pub fn resolve_soname(lib: &str) -> ObjectResult<String> {
    if let Some(name) = pkg_config_name(lib) {
        return Ok(name);
    }
    if let Some(name) = ldconfig_name(lib) {
        return Ok(name);
    }
    Err(ObjectError::LibraryNotFound { lib: lib.to_string() })
}

/// `pkg-config --libs-only-l <lib>` → first `-lfoo` → `libfoo.so`,
/// versioned through ldconfig when possible.
fn pkg_config_name(lib: &str) -> Option<String> {
    let out = Command::new("pkg-config").args(["--libs-only-l", lib]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    let link_name = stdout.split_whitespace().find_map(|tok| tok.strip_prefix("-l"))?;
    debug!("pkg-config resolved {lib} -> -l{link_name}");
    ldconfig_name(link_name).or_else(|| Some(format!("lib{link_name}.so")))
}

/// Scan `ldconfig -p` for the versioned soname of `lib<name>.so`.
fn ldconfig_name(lib: &str) -> Option<String> {
    let out = Command::new("ldconfig").arg("-p").output().ok()?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    let prefix = format!("lib{lib}.so");
    for line in stdout.lines() {
        let Some(name) = line.trim().split_whitespace().next() else { continue };
        if name.starts_with(&prefix) {
            debug!("ldconfig resolved {lib} -> {name}");
            return Some(name.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_set() {
        let libs = needed_libraries(false, false, &[]).unwrap();
        assert_eq!(libs, vec![LIBC.to_string()]);
    }

    #[test]
    fn test_parallel_and_math_add_libraries() {
        let libs = needed_libraries(true, true, &[]).unwrap();
        assert_eq!(
            libs,
            vec![LIBC.to_string(), LIBPTHREAD.to_string(), LIBM.to_string()]
        );
    }

    #[test]
    fn test_unresolvable_import_is_an_error() {
        let err = needed_libraries(false, false, &["flap_test_no_such_library".to_string()])
            .unwrap_err();
        assert!(matches!(err, ObjectError::LibraryNotFound { .. }));
        assert!(err.to_string().contains("flap_test_no_such_library"));
    }
}
