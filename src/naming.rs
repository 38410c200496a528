//! Sequential per-tenant VM names
//!
//! VM names look like `<tenant>_<n>`. The next names for a tenant continue
//! after the highest suffix currently present on the host. Allocation is a
//! pure function over a snapshot of host VM names and takes no lock: two
//! concurrent runs for the same tenant can hand out the same names, so runs
//! must be serialized per tenant by the caller.

use regex::{Regex, RegexBuilder};

pub struct NameAllocator;

impl NameAllocator {
    /// Return `count` contiguous names following the highest existing suffix
    pub fn allocate<I, S>(tenant: &str, count: u32, host_vm_names: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let start = u64::from(Self::highest_suffix(tenant, host_vm_names)) + 1;
        (start..start + u64::from(count))
            .map(|n| format!("{}_{}", tenant, n))
            .collect()
    }

    /// Highest `<tenant>_<n>` suffix among `host_vm_names`, or 0
    pub fn highest_suffix<I, S>(tenant: &str, host_vm_names: I) -> u32
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pattern = Self::pattern(tenant);
        host_vm_names
            .into_iter()
            .filter_map(|name| {
                pattern
                    .captures(name.as_ref())
                    .and_then(|c| c[1].parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0)
    }

    /// Whether `name` belongs to `tenant`'s numbering sequence
    pub fn is_tenant_vm(tenant: &str, name: &str) -> bool {
        Self::pattern(tenant).is_match(name)
    }

    // Hyper-V VM names are case-insensitive
    fn pattern(tenant: &str) -> Regex {
        // escaped tenant names always compile
        RegexBuilder::new(&format!(r"^{}_(\d+)$", regex::escape(tenant)))
            .case_insensitive(true)
            .build()
            .expect("valid name pattern")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_vm_for_tenant() {
        let names = NameAllocator::allocate("contoso", 1, Vec::<String>::new());
        assert_eq!(names, vec!["contoso_1"]);
    }

    #[test]
    fn test_continues_after_highest() {
        let host = ["contoso_1", "contoso_7", "contoso_3"];
        assert_eq!(NameAllocator::allocate("contoso", 1, host), vec!["contoso_8"]);
    }

    #[test]
    fn test_block_is_contiguous_and_disjoint() {
        let host = vec!["contoso_2".to_string(), "contoso_5".to_string()];
        let names = NameAllocator::allocate("contoso", 4, &host);

        assert_eq!(names, vec!["contoso_6", "contoso_7", "contoso_8", "contoso_9"]);
        assert!(names.iter().all(|n| !host.contains(n)));
    }

    #[test]
    fn test_ignores_other_names() {
        let host = [
            "fabrikam_40",
            "contoso_x",
            "contoso_",
            "contoso_3_old",
            "my-dc01",
            "contoso-lab_9",
            "xcontoso_12",
        ];
        assert_eq!(NameAllocator::highest_suffix("contoso", host), 0);
        assert_eq!(NameAllocator::allocate("contoso", 2, host), vec!["contoso_1", "contoso_2"]);
    }

    #[test]
    fn test_host_names_match_regardless_of_case() {
        let host = ["Contoso_1", "CONTOSO_4", "contoso_2"];
        assert_eq!(NameAllocator::allocate("contoso", 1, host), vec!["contoso_5"]);
        assert_eq!(NameAllocator::allocate("Contoso", 1, ["contoso_1"]), vec!["Contoso_2"]);
        assert!(NameAllocator::is_tenant_vm("contoso", "Contoso_1"));
    }

    #[test]
    fn test_tenant_with_regex_metacharacters() {
        let host = ["a.b_4", "axb_9"];
        assert_eq!(NameAllocator::highest_suffix("a.b", host), 4);
    }

    #[test]
    fn test_overflowing_suffix_is_ignored() {
        let host = ["contoso_99999999999999", "contoso_2"];
        assert_eq!(NameAllocator::highest_suffix("contoso", host), 2);
    }

    #[test]
    fn test_zero_count() {
        assert!(NameAllocator::allocate("contoso", 0, ["contoso_1"]).is_empty());
    }

    #[test]
    fn test_is_tenant_vm() {
        assert!(NameAllocator::is_tenant_vm("contoso", "contoso_12"));
        assert!(!NameAllocator::is_tenant_vm("contoso", "fabrikam_12"));
    }
}
