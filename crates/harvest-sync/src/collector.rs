use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use harvest_core::ItemId;
use serde::Deserialize;
use tracing::{info, warn};

use crate::HarvestError;

/// Source of the full candidate id universe for one run.
#[async_trait]
pub trait IdCollector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn collect(&self) -> Result<Vec<ItemId>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdListFile {
    Plain(Vec<String>),
    Wrapped {
        #[serde(alias = "workIds", alias = "work_ids", alias = "ids")]
        item_ids: Vec<String>,
    },
}

/// Validates, de-duplicates and keeps first-seen order. Invalid ids are dropped with a warning.
pub fn parse_id_list(raw: &[u8]) -> Result<Vec<ItemId>> {
    let parsed: IdListFile = serde_json::from_slice(raw).context("parsing item id list")?;
    let entries = match parsed {
        IdListFile::Plain(ids) => ids,
        IdListFile::Wrapped { item_ids } => item_ids,
    };

    let mut seen = HashSet::with_capacity(entries.len());
    let mut ids = Vec::with_capacity(entries.len());
    let mut rejected = 0usize;
    for entry in entries {
        match ItemId::parse(&entry) {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
            Err(_) => rejected += 1,
        }
    }
    if rejected > 0 {
        warn!(rejected, "dropped malformed item ids from list");
    }
    if ids.is_empty() {
        bail!("item id list contains no valid ids");
    }
    Ok(ids)
}

/// Static asset shipped with the deployment.
#[derive(Debug, Clone)]
pub struct StaticIdList {
    path: PathBuf,
}

impl StaticIdList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IdCollector for StaticIdList {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn collect(&self) -> Result<Vec<ItemId>> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_id_list(&raw).with_context(|| format!("loading ids from {}", self.path.display()))
    }
}

/// Id list published at a URL in the same JSON shape as the static asset.
#[derive(Debug, Clone)]
pub struct RemoteIdListCollector {
    http: reqwest::Client,
    url: String,
}

impl RemoteIdListCollector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .context("building id list client")?;
        Ok(Self { http, url: url.into() })
    }
}

#[async_trait]
impl IdCollector for RemoteIdListCollector {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn collect(&self) -> Result<Vec<ItemId>> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("requesting {}", self.url))?
            .error_for_status()
            .with_context(|| format!("id list status from {}", self.url))?;
        let body = resp.bytes().await.context("reading id list body")?;
        parse_id_list(&body)
    }
}

/// Primary collector with a static fallback. Both failing is a configuration error.
pub struct FallbackIdCollector {
    primary: Option<Box<dyn IdCollector>>,
    fallback: Box<dyn IdCollector>,
}

impl FallbackIdCollector {
    pub fn new(primary: Option<Box<dyn IdCollector>>, fallback: Box<dyn IdCollector>) -> Self {
        Self { primary, fallback }
    }

    pub async fn collect_ids(&self) -> Result<Vec<ItemId>, HarvestError> {
        if let Some(primary) = &self.primary {
            match primary.collect().await {
                Ok(ids) => {
                    info!(source = primary.name(), count = ids.len(), "item ids collected");
                    return Ok(ids);
                }
                Err(err) => warn!(
                    source = primary.name(),
                    error = %format!("{err:#}"),
                    "id collection failed; using fallback list"
                ),
            }
        }

        match self.fallback.collect().await {
            Ok(ids) => {
                info!(source = self.fallback.name(), count = ids.len(), "item ids collected");
                Ok(ids)
            }
            Err(err) => Err(HarvestError::Configuration(format!(
                "id source and fallback both failed: {err:#}"
            ))),
        }
    }
}

#[async_trait]
impl IdCollector for FallbackIdCollector {
    fn name(&self) -> &'static str {
        "fallback-chain"
    }

    async fn collect(&self) -> Result<Vec<ItemId>> {
        Ok(self.collect_ids().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct Broken;

    #[async_trait]
    impl IdCollector for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn collect(&self) -> Result<Vec<ItemId>> {
            bail!("upstream listing unavailable")
        }
    }

    fn temp_list(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(body.as_bytes()).expect("write");
        file
    }

    #[test]
    fn accepts_plain_and_wrapped_lists() {
        let plain = parse_id_list(br#"["RJ000001", "RJ000002", "RJ000001", "bogus"]"#).unwrap();
        assert_eq!(plain.len(), 2);

        let wrapped = parse_id_list(br#"{"workIds": ["RJ01234567"]}"#).unwrap();
        assert_eq!(wrapped[0].as_str(), "RJ01234567");

        assert!(parse_id_list(br#"["nope"]"#).is_err());
    }

    #[tokio::test]
    async fn static_list_reads_file() {
        let file = temp_list(r#"["RJ000010", "RJ000011"]"#);
        let ids = StaticIdList::new(file.path()).collect().await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn falls_back_when_primary_fails() {
        let file = temp_list(r#"["RJ000010"]"#);
        let chain = FallbackIdCollector::new(
            Some(Box::new(Broken)),
            Box::new(StaticIdList::new(file.path())),
        );
        let ids = chain.collect_ids().await.unwrap();
        assert_eq!(ids, vec![ItemId::parse("RJ000010").unwrap()]);
    }

    #[tokio::test]
    async fn both_sources_failing_is_a_configuration_error() {
        let chain = FallbackIdCollector::new(
            Some(Box::new(Broken)),
            Box::new(StaticIdList::new("/definitely/not/here.json")),
        );
        let err = chain.collect_ids().await.unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(_)));
    }
}
