//! `local@domain` name handling for federated meshes.

/// Splits `name` into its local part and domain, if any. Only the last `@`
/// counts, so a local name may itself contain `@`.
pub fn split(name: &str) -> (&str, Option<&str>) {
    match name.rfind('@') {
        Some(at) if at + 1 < name.len() => (&name[..at], Some(&name[at + 1..])),
        _ => (name, None),
    }
}

pub fn domain_of(name: &str) -> Option<&str> {
    split(name).1
}

pub fn is_interdomain(name: &str) -> bool {
    domain_of(name).is_some()
}

pub fn join(local: &str, domain: &str) -> String {
    format!("{local}@{domain}")
}
