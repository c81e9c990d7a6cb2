//! Processing plugin serving items from a local catalog directory.
//!
//! Layout of the source directory: one subdirectory per collection, one file
//! per catalog item named after its identifier. Delivered items are copied to
//! `<delivery_dir>/<order_id>/<identifier>`; packages are directories under
//! `<delivery_dir>/packages/` holding the files plus a `SHA256SUMS` manifest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::error::PluginError;
use super::traits::OrderProcessor;
use super::types::{
    DeliveredItem, ItemRequest, PackageRequest, ParsedExtension, ParsedOption, Timeslot,
};
use crate::config::ProcessorConfig;
use crate::order::SubscriptionSpec;

const BUFFER_SIZE: usize = 64 * 1024;

/// Subscription length when the request does not name an end date.
const DEFAULT_SUBSCRIPTION_DAYS: i64 = 30;

static BBOX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*$")
        .unwrap()
});

static EXTENSION_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

static SAFE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

const FORMATS: &[&str] = &["GeoTIFF", "JPEG2000", "NetCDF", "SAFE"];

const PACKAGING_FORMATS: &[&str] = &["bundle"];

/// File system backed processing plugin.
#[derive(Debug, Clone)]
pub struct LocalArchiveProcessor {
    config: ProcessorConfig,
}

impl LocalArchiveProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    fn source_path(&self, collection: &str, identifier: &str) -> Result<PathBuf, PluginError> {
        if !SAFE_NAME.is_match(collection) || !SAFE_NAME.is_match(identifier) {
            return Err(PluginError::ItemNotFound(format!(
                "{}/{}",
                collection, identifier
            )));
        }
        Ok(self.config.source_dir.join(collection).join(identifier))
    }

    /// Copy `source` to `destination` through a temporary file, returning the
    /// byte count and SHA-256 of the content.
    async fn copy_with_checksum(
        source: &Path,
        destination: &Path,
    ) -> Result<(u64, String), std::io::Error> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let partial = destination.with_extension("partial");
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(source).await?);
        let mut writer = File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            writer.write_all(&buffer[..read]).await?;
            total += read as u64;
        }
        writer.flush().await?;
        drop(writer);

        fs::rename(&partial, destination).await?;
        Ok((total, format!("{:x}", hasher.finalize())))
    }

    async fn checksum(path: &Path) -> Result<String, std::io::Error> {
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(path).await?);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn parse_option(name: &str, raw: &str) -> Result<String, PluginError> {
        let value = raw.trim();
        match name {
            "format" => FORMATS
                .iter()
                .find(|f| f.eq_ignore_ascii_case(value))
                .map(|f| f.to_string())
                .ok_or_else(|| {
                    PluginError::invalid_option(name, format!("unsupported format {}", value))
                }),
            "bbox" => {
                let caps = BBOX.captures(value).ok_or_else(|| {
                    PluginError::invalid_option(name, "expected min_lon,min_lat,max_lon,max_lat")
                })?;
                let coords: Vec<f64> = (1..=4)
                    .filter_map(|i| caps.get(i).and_then(|m| m.as_str().parse().ok()))
                    .collect();
                let [min_lon, min_lat, max_lon, max_lat] = coords[..] else {
                    return Err(PluginError::invalid_option(name, "expected four coordinates"));
                };
                if min_lon >= max_lon || min_lat >= max_lat {
                    return Err(PluginError::invalid_option(name, "empty bounding box"));
                }
                if !(-180.0..=180.0).contains(&min_lon)
                    || !(-180.0..=180.0).contains(&max_lon)
                    || !(-90.0..=90.0).contains(&min_lat)
                    || !(-90.0..=90.0).contains(&max_lat)
                {
                    return Err(PluginError::invalid_option(name, "coordinates out of range"));
                }
                Ok(format!("{},{},{},{}", min_lon, min_lat, max_lon, max_lat))
            }
            "cloud_cover" => {
                let pct: u8 = value
                    .parse()
                    .map_err(|_| PluginError::invalid_option(name, "expected an integer"))?;
                if pct > 100 {
                    return Err(PluginError::invalid_option(name, "must be between 0 and 100"));
                }
                Ok(pct.to_string())
            }
            "packaging" => PACKAGING_FORMATS
                .iter()
                .find(|f| f.eq_ignore_ascii_case(value))
                .map(|f| f.to_string())
                .ok_or_else(|| {
                    PluginError::invalid_option(name, format!("unsupported packaging {}", value))
                }),
            _ => Err(PluginError::invalid_option(name, "unknown option")),
        }
    }
}

fn io_error(context: &str, e: std::io::Error) -> PluginError {
    // Missing parents and permission problems do not heal by retrying.
    match e.kind() {
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput => {
            PluginError::permanent(format!("{}: {}", context, e))
        }
        _ => PluginError::transient(format!("{}: {}", context, e)),
    }
}

#[async_trait]
impl OrderProcessor for LocalArchiveProcessor {
    fn name(&self) -> &str {
        "local-archive"
    }

    fn validate_and_parse_option(
        &self,
        name: &str,
        raw: &str,
    ) -> Result<ParsedOption, PluginError> {
        Ok(ParsedOption {
            name: name.to_string(),
            value: Self::parse_option(name, raw)?,
        })
    }

    fn validate_and_parse_extension(
        &self,
        name: &str,
        raw: &str,
    ) -> Result<ParsedExtension, PluginError> {
        if !EXTENSION_NAME.is_match(name) {
            return Err(PluginError::invalid_extension(name, "malformed name"));
        }
        let value = raw.trim();
        if value.is_empty() {
            return Err(PluginError::invalid_extension(name, "empty value"));
        }
        Ok(ParsedExtension {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    async fn acquire_and_deliver_item(
        &self,
        request: &ItemRequest,
    ) -> Result<DeliveredItem, PluginError> {
        let source = self.source_path(&request.collection, &request.identifier)?;
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(PluginError::ItemNotFound(request.identifier.clone()));
        }

        let destination = self
            .config
            .delivery_dir
            .join(&request.order_id)
            .join(&request.identifier);

        debug!(
            "Delivering {} (attempt {}) to {:?}",
            request.identifier, request.attempt, destination
        );

        let (size_bytes, checksum) = Self::copy_with_checksum(&source, &destination)
            .await
            .map_err(|e| io_error("copy failed", e))?;

        Ok(DeliveredItem {
            location: destination.display().to_string(),
            checksum: Some(checksum),
            size_bytes,
        })
    }

    async fn package_files(&self, request: &PackageRequest) -> Result<String, PluginError> {
        if !PACKAGING_FORMATS.contains(&request.format.as_str()) {
            return Err(PluginError::Packaging(format!(
                "unsupported packaging {}",
                request.format
            )));
        }

        let package_dir = self
            .config
            .delivery_dir
            .join("packages")
            .join(&request.order_id);
        fs::create_dir_all(&package_dir)
            .await
            .map_err(|e| PluginError::Packaging(e.to_string()))?;

        let mut manifest = String::new();
        for location in &request.locations {
            let source = PathBuf::from(location);
            let file_name = source
                .file_name()
                .ok_or_else(|| PluginError::Packaging(format!("bad location {}", location)))?;
            let destination = package_dir.join(file_name);
            let (_, checksum) = Self::copy_with_checksum(&source, &destination)
                .await
                .map_err(|e| PluginError::Packaging(format!("{}: {}", location, e)))?;
            manifest.push_str(&format!("{}  {}\n", checksum, file_name.to_string_lossy()));
        }

        fs::write(package_dir.join("SHA256SUMS"), manifest)
            .await
            .map_err(|e| PluginError::Packaging(e.to_string()))?;

        info!(
            "Packaged {} files for order {}",
            request.locations.len(),
            request.order_id
        );
        Ok(package_dir.display().to_string())
    }

    async fn clean_files(
        &self,
        older_than: DateTime<Utc>,
        locations: &[String],
    ) -> Result<usize, PluginError> {
        let mut deleted = 0;
        for location in locations {
            let path = PathBuf::from(location);
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("stat failed", e)),
            };

            let created: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(older_than);
            if created > older_than {
                debug!("Keeping {:?}: newer than cutoff", path);
                continue;
            }

            let result = if meta.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete {:?}: {}", path, e);
                    return Err(io_error("delete failed", e));
                }
            }
        }
        Ok(deleted)
    }

    async fn subscription_batch_item_identifiers(
        &self,
        timeslot: Timeslot,
        collection: &str,
        _options: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, PluginError> {
        if !SAFE_NAME.is_match(collection) {
            return Ok(Vec::new());
        }
        let dir = self.config.source_dir.join(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("listing collection failed", e)),
        };

        let mut found: Vec<(DateTime<Utc>, String)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing collection failed", e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| io_error("stat failed", e))?;
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let published = DateTime::<Utc>::from(modified);
            if timeslot.contains(published) {
                found.push((published, entry.file_name().to_string_lossy().to_string()));
            }
        }

        found.sort();
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    fn subscription_duration(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), PluginError> {
        let begin = spec.requested_begin.unwrap_or_else(Utc::now);
        let end = spec
            .requested_end
            .unwrap_or(begin + Duration::days(DEFAULT_SUBSCRIPTION_DAYS));
        if end <= begin {
            return Err(PluginError::invalid_option(
                "subscription",
                "end must be after begin",
            ));
        }
        Ok((begin, end))
    }
}

/// Verify a delivered file against the checksum reported at delivery.
pub async fn verify_delivery(item: &DeliveredItem) -> Result<bool, PluginError> {
    let Some(expected) = &item.checksum else {
        return Ok(true);
    };
    let actual = LocalArchiveProcessor::checksum(Path::new(&item.location))
        .await
        .map_err(|e| io_error("checksum failed", e))?;
    Ok(&actual == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn processor(dir: &TempDir) -> LocalArchiveProcessor {
        LocalArchiveProcessor::new(ProcessorConfig {
            source_dir: dir.path().join("catalog"),
            delivery_dir: dir.path().join("delivery"),
        })
    }

    async fn seed(dir: &TempDir, collection: &str, identifier: &str, content: &[u8]) {
        let path = dir.path().join("catalog").join(collection);
        fs::create_dir_all(&path).await.unwrap();
        fs::write(path.join(identifier), content).await.unwrap();
    }

    fn request(identifier: &str) -> ItemRequest {
        ItemRequest {
            order_id: "order-1".to_string(),
            order_item_id: "item-1".to_string(),
            identifier: identifier.to_string(),
            collection: "S2".to_string(),
            options: BTreeMap::new(),
            attempt: 1,
        }
    }

    #[test]
    fn test_parse_format_option() {
        let dir = TempDir::new().unwrap();
        let p = processor(&dir);
        let parsed = p.validate_and_parse_option("format", "geotiff").unwrap();
        assert_eq!(parsed.value, "GeoTIFF");
        assert!(p.validate_and_parse_option("format", "PNG").is_err());
        assert!(p.validate_and_parse_option("colour", "red").is_err());
    }

    #[test]
    fn test_parse_bbox_option() {
        let dir = TempDir::new().unwrap();
        let p = processor(&dir);
        let parsed = p
            .validate_and_parse_option("bbox", " 10.5, 40, 12 ,42.25")
            .unwrap();
        assert_eq!(parsed.value, "10.5,40,12,42.25");
        assert!(p.validate_and_parse_option("bbox", "12,40,10,42").is_err());
        assert!(p.validate_and_parse_option("bbox", "a,b,c,d").is_err());
        assert!(p.validate_and_parse_option("bbox", "0,0,200,10").is_err());
    }

    #[test]
    fn test_parse_cloud_cover_option() {
        let dir = TempDir::new().unwrap();
        let p = processor(&dir);
        assert_eq!(
            p.validate_and_parse_option("cloud_cover", "20").unwrap().value,
            "20"
        );
        assert!(p.validate_and_parse_option("cloud_cover", "120").is_err());
    }

    #[test]
    fn test_parse_extension() {
        let dir = TempDir::new().unwrap();
        let p = processor(&dir);
        assert!(p.validate_and_parse_extension("priority_hint", "high").is_ok());
        assert!(p.validate_and_parse_extension("Bad-Name", "x").is_err());
        assert!(p.validate_and_parse_extension("note", "  ").is_err());
    }

    #[tokio::test]
    async fn test_acquire_copies_and_checksums() {
        let dir = TempDir::new().unwrap();
        seed(&dir, "S2", "S2A_001", b"pixels").await;
        let p = processor(&dir);

        let delivered = p.acquire_and_deliver_item(&request("S2A_001")).await.unwrap();
        assert_eq!(delivered.size_bytes, 6);
        assert_eq!(fs::read(&delivered.location).await.unwrap(), b"pixels");
        assert!(verify_delivery(&delivered).await.unwrap());

        // Repeated delivery lands on the same location.
        let again = p.acquire_and_deliver_item(&request("S2A_001")).await.unwrap();
        assert_eq!(again.location, delivered.location);
        assert_eq!(again.checksum, delivered.checksum);
    }

    #[tokio::test]
    async fn test_acquire_missing_item() {
        let dir = TempDir::new().unwrap();
        let p = processor(&dir);
        let err = p
            .acquire_and_deliver_item(&request("S2A_404"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ItemNotFound(_)));

        let err = p
            .acquire_and_deliver_item(&request("../../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_package_writes_manifest() {
        let dir = TempDir::new().unwrap();
        seed(&dir, "S2", "a", b"one").await;
        seed(&dir, "S2", "b", b"two").await;
        let p = processor(&dir);

        let a = p.acquire_and_deliver_item(&request("a")).await.unwrap();
        let b = p.acquire_and_deliver_item(&request("b")).await.unwrap();

        let location = p
            .package_files(&PackageRequest {
                order_id: "order-1".to_string(),
                format: "bundle".to_string(),
                locations: vec![a.location, b.location],
            })
            .await
            .unwrap();

        let manifest = fs::read_to_string(Path::new(&location).join("SHA256SUMS"))
            .await
            .unwrap();
        assert_eq!(manifest.lines().count(), 2);
        assert!(manifest.contains("  a\n"));
    }

    #[tokio::test]
    async fn test_package_rejects_unknown_format() {
        let dir = TempDir::new().unwrap();
        let p = processor(&dir);
        let err = p
            .package_files(&PackageRequest {
                order_id: "o".to_string(),
                format: "zip".to_string(),
                locations: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Packaging(_)));
    }

    #[tokio::test]
    async fn test_clean_files_respects_cutoff_and_missing() {
        let dir = TempDir::new().unwrap();
        seed(&dir, "S2", "a", b"one").await;
        let p = processor(&dir);
        let delivered = p.acquire_and_deliver_item(&request("a")).await.unwrap();
        let locations = vec![delivered.location.clone(), "/nonexistent/file".to_string()];

        let kept = p
            .clean_files(Utc::now() - Duration::days(1), &locations)
            .await
            .unwrap();
        assert_eq!(kept, 0);

        let deleted = p
            .clean_files(Utc::now() + Duration::seconds(5), &locations)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!Path::new(&delivered.location).exists());

        let again = p
            .clean_files(Utc::now() + Duration::seconds(5), &locations)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_batch_identifiers_by_timeslot() {
        let dir = TempDir::new().unwrap();
        seed(&dir, "S2", "S2A_new", b"x").await;
        let p = processor(&dir);

        let now = Utc::now();
        let current = Timeslot::new(now - Duration::hours(1), Duration::hours(2));
        let ids = p
            .subscription_batch_item_identifiers(current, "S2", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(ids, vec!["S2A_new".to_string()]);

        let past = Timeslot::new(now - Duration::days(2), Duration::days(1));
        let ids = p
            .subscription_batch_item_identifiers(past, "S2", &BTreeMap::new())
            .await
            .unwrap();
        assert!(ids.is_empty());

        let ids = p
            .subscription_batch_item_identifiers(current, "L8", &BTreeMap::new())
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_subscription_duration() {
        let dir = TempDir::new().unwrap();
        let p = processor(&dir);
        let begin = Utc::now();
        let spec = SubscriptionSpec {
            collection: "S2".to_string(),
            options: BTreeMap::new(),
            requested_begin: Some(begin),
            requested_end: None,
            timeslot_secs: None,
        };
        let (b, e) = p.subscription_duration(&spec).unwrap();
        assert_eq!(b, begin);
        assert_eq!(e, begin + Duration::days(30));

        let bad = SubscriptionSpec {
            requested_end: Some(begin - Duration::days(1)),
            ..spec
        };
        assert!(p.subscription_duration(&bad).is_err());
    }
}
