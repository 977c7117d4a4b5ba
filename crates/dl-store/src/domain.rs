use std::net::IpAddr;

/// Second-level labels that registries put under two-letter country codes
/// (`bbc.co.uk`, `example.com.au`).
const REGISTRY_LABELS: &[&str] = &["co", "com", "net", "org", "gov", "edu", "ac", "or", "ne", "go"];

/// Normalize a logged domain: lowercase, no trailing dot.
pub fn normalize(fqdn: &str) -> String {
    fqdn.trim().trim_end_matches('.').to_lowercase()
}

/// Key under which a logged domain is grouped in the archive.
///
/// `x.ads.example.com` → `example.com`, `a.b.example.co.uk` → `example.co.uk`.
/// IP literals and single labels are kept as they are.
pub fn grouping_key(fqdn: &str) -> String {
    let fqdn = normalize(fqdn);
    if fqdn.parse::<IpAddr>().is_ok() {
        return fqdn;
    }

    let labels: Vec<&str> = fqdn.split('.').filter(|l| !l.is_empty()).collect();
    let keep = match labels.as_slice() {
        [.., sld, tld] if labels.len() >= 3 && tld.len() == 2 && REGISTRY_LABELS.contains(sld) => 3,
        _ => 2,
    };

    if labels.len() <= keep {
        labels.join(".")
    } else {
        labels[labels.len() - keep..].join(".")
    }
}

/// True when `fqdn` equals `domain` or is a dot-delimited subdomain of it.
pub fn is_same_or_subdomain(fqdn: &str, domain: &str) -> bool {
    fqdn == domain
        || (fqdn.len() > domain.len()
            && fqdn.ends_with(domain)
            && fqdn.as_bytes()[fqdn.len() - domain.len() - 1] == b'.')
}
