use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use tokio::task::JoinSet;
use tracing::{info, warn};

use dl_common::config::AdblockSource;

/// On-disk/remote blocklist layouts understood by the importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    /// `0.0.0.0 domain` / `127.0.0.1 domain`
    Hosts,
    /// One domain per line.
    DomainList,
    /// `address=/domain/`
    Dnsmasq,
}

impl ListFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hosts" => Some(Self::Hosts),
            "domain_list" => Some(Self::DomainList),
            "dnsmasq" => Some(Self::Dnsmasq),
            _ => None,
        }
    }
}

/// Per-source outcome of a fetch.
#[derive(Debug)]
pub struct SourceResult {
    pub name: String,
    pub domain_count: usize,
    pub error: Option<String>,
}

/// Fetch and parse every source in parallel. Failing sources are reported
/// and skipped; the union of everything that parsed is returned.
pub async fn fetch_all(sources: &[AdblockSource]) -> (FxHashSet<String>, Vec<SourceResult>) {
    let mut tasks = JoinSet::new();
    for (i, source) in sources.iter().cloned().enumerate() {
        tasks.spawn(async move { (i, fetch_source(&source).await) });
    }

    let mut domains = FxHashSet::default();
    let mut results: Vec<Option<SourceResult>> = sources.iter().map(|_| None).collect();

    while let Some(joined) = tasks.join_next().await {
        let (i, outcome) = match joined {
            Ok(v) => v,
            Err(e) => {
                warn!("Blocklist fetch task failed: {}", e);
                continue;
            }
        };
        let name = sources[i].name.clone();
        results[i] = Some(match outcome {
            Ok(list) => {
                info!("Blocklist source '{}': {} domains", name, list.len());
                let domain_count = list.len();
                domains.extend(list);
                SourceResult { name, domain_count, error: None }
            }
            Err(e) => {
                warn!("Failed to fetch blocklist source '{}': {:#}", name, e);
                SourceResult { name, domain_count: 0, error: Some(e.to_string()) }
            }
        });
    }

    let results = results
        .into_iter()
        .zip(sources)
        .map(|(r, s)| {
            r.unwrap_or_else(|| SourceResult {
                name: s.name.clone(),
                domain_count: 0,
                error: Some("task aborted".to_string()),
            })
        })
        .collect();

    info!("Total unique blocklist domains: {}", domains.len());
    (domains, results)
}

async fn fetch_source(source: &AdblockSource) -> Result<Vec<String>> {
    let body = fetch(&source.url).await?;
    let format = ListFormat::from_name(&source.format).unwrap_or_else(|| {
        warn!("Unknown format '{}' for source '{}', trying hosts", source.format, source.name);
        ListFormat::Hosts
    });
    Ok(parse_list(format, &body))
}

/// Read a list from an http(s) URL, a `file://` URL or a plain path.
async fn fetch(url: &str) -> Result<String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;

        let response = client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read blocklist {}", path))
    }
}

/// Extract valid, lowercased domains from a list body.
pub fn parse_list(format: ListFormat, content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| match format {
            ListFormat::Hosts => {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("0.0.0.0" | "127.0.0.1"), Some(domain)) => Some(domain),
                    _ => None,
                }
            }
            ListFormat::DomainList => Some(line),
            ListFormat::Dnsmasq => line
                .strip_prefix("address=/")
                .and_then(|rest| rest.strip_suffix('/'))
                .and_then(|rest| rest.split('/').next()),
        })
        .map(|domain| domain.trim_end_matches('.').to_lowercase())
        .filter(|domain| is_valid_domain(domain))
        .collect()
}

pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }

    // localhost entries and IP literals show up in most hosts files
    const SKIPPED_PREFIXES: [&str; 6] = ["localhost", "broadcasthost", "local", "ip6-", "0.", "127."];
    if SKIPPED_PREFIXES.iter().any(|p| domain.starts_with(p)) {
        return false;
    }

    domain.chars().next().is_some_and(|c| c.is_alphanumeric())
        && domain
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '.' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts_file() {
        let content = r#"
# Comment
0.0.0.0 ads.example.com
127.0.0.1 Tracker.net
0.0.0.0 localhost
192.168.1.1 router.lan
# Another comment
0.0.0.0 bad.site.com # trailing comment
"#;
        let domains = parse_list(ListFormat::Hosts, content);
        assert_eq!(domains, vec!["ads.example.com", "tracker.net", "bad.site.com"]);
    }

    #[test]
    fn test_parse_domain_list() {
        let content = "ads.example.com\ntracker.net.\n# comment\n! adblock comment\n\nnodot\n";
        let domains = parse_list(ListFormat::DomainList, content);
        assert_eq!(domains, vec!["ads.example.com", "tracker.net"]);
    }

    #[test]
    fn test_parse_dnsmasq_format() {
        let content = "address=/ads.example.com/\naddress=/tracker.net/0.0.0.0\nserver=/x.com/\n";
        let domains = parse_list(ListFormat::Dnsmasq, content);
        assert_eq!(domains, vec!["ads.example.com"]);
    }

    #[test]
    fn test_valid_domain() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("ads-1.example.com"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("nodot"));
        assert!(!is_valid_domain("bad domain.com"));
        assert!(!is_valid_domain("-x.com"));
    }

    #[tokio::test]
    async fn test_fetch_local_sources() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, "0.0.0.0 ads.example.com\n0.0.0.0 tracker.net\n").unwrap();

        let sources = vec![
            AdblockSource {
                name: "local".into(),
                url: format!("file://{}", hosts.display()),
                format: "hosts".into(),
            },
            AdblockSource {
                name: "missing".into(),
                url: dir.path().join("nope").display().to_string(),
                format: "domain_list".into(),
            },
        ];

        let (domains, results) = fetch_all(&sources).await;
        assert_eq!(domains.len(), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].domain_count, 2);
        assert!(results[0].error.is_none());
        assert!(results[1].error.is_some());
    }
}
