//! Module allowlist checks.
//!
//! A dotted name is allowed when it is listed itself or when any of its parent
//! packages is listed (`"json"` admits `"json.decoder"`). Relative imports are
//! never allowed from guest code; that decision lives in the import gate.

use std::collections::BTreeSet;

use crate::types::GuestError;

/// Checks whether `module_name` is permitted by `allowed`.
pub fn check_module_allowed(
    module_name: &str,
    allowed: &BTreeSet<String>,
) -> Result<(), GuestError> {
    if module_name.is_empty() {
        return Err(denied(module_name));
    }
    let mut candidate = module_name;
    loop {
        if allowed.contains(candidate) {
            return Ok(());
        }
        match candidate.rfind('.') {
            Some(dot) => candidate = &candidate[..dot],
            None => return Err(denied(module_name)),
        }
    }
}

/// Builds the allowlist set from configured names, dropping blanks.
pub fn build_allowed_set<I, S>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| n.as_ref().trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

fn denied(module_name: &str) -> GuestError {
    GuestError::ImportDenied {
        module_name: module_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_ALLOWED_MODULES;

    fn set(names: &[&str]) -> BTreeSet<String> {
        build_allowed_set(names)
    }

    #[test]
    fn listed_module_is_allowed() {
        assert_eq!(check_module_allowed("math", &set(&["math"])), Ok(()));
    }

    #[test]
    fn unlisted_module_is_denied_with_its_name() {
        assert_eq!(
            check_module_allowed("socket", &set(DEFAULT_ALLOWED_MODULES)),
            Err(GuestError::ImportDenied {
                module_name: "socket".to_string()
            })
        );
    }

    #[test]
    fn submodule_of_listed_package_is_allowed() {
        assert_eq!(check_module_allowed("json.decoder", &set(&["json"])), Ok(()));
        assert_eq!(check_module_allowed("a.b.c", &set(&["a.b"])), Ok(()));
    }

    #[test]
    fn listed_submodule_does_not_admit_parent() {
        // Listing os.path must not open up the whole os module.
        assert!(check_module_allowed("os", &set(&["os.path"])).is_err());
    }

    #[test]
    fn prefix_without_dot_is_not_a_parent() {
        assert!(check_module_allowed("mathx", &set(&["math"])).is_err());
    }

    #[test]
    fn empty_name_and_empty_set_are_denied() {
        assert!(check_module_allowed("", &set(&["math"])).is_err());
        assert!(check_module_allowed("math", &BTreeSet::new()).is_err());
    }

    #[test]
    fn build_allowed_set_trims_and_drops_blanks() {
        let allowed = build_allowed_set([" math ", "", "cmath"]);
        assert_eq!(allowed.len(), 2);
        assert!(allowed.contains("math"));
        assert!(allowed.contains("cmath"));
    }
}
