//! Built-in pool templates: YAML loading, defaulting, label hygiene and the
//! stable generation hash that marks records as current or stale.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use hatch_store::{INTERNAL_LABEL_PREFIX, LABEL_POOL, LABEL_TEMPLATE_HASH};

pub const TEMPLATE_KIND: &str = "SandboxTemplate";

/// Default expected-usage percentage when a template does not set one.
pub const DEFAULT_EXPECT_USAGE: u32 = 50;

/// Alphabet for hash encoding and generated name suffixes. Skips vowels and
/// ambiguous characters so values stay DNS-safe and never spell anything.
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Defaults applied to templates that leave sizing unset.
#[derive(Clone, Copy, Debug)]
pub struct TemplateDefaults {
    pub min_pool_size: i64,
    pub max_pool_size_factor: i64,
}

impl Default for TemplateDefaults {
    fn default() -> Self {
        Self {
            min_pool_size: 5,
            max_pool_size_factor: 2,
        }
    }
}

/// On-disk template document.
#[derive(Debug, Deserialize)]
struct TemplateFile {
    kind: String,
    metadata: TemplateMetadata,
    spec: TemplateSpec,
}

#[derive(Debug, Deserialize)]
struct TemplateMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateSpec {
    image: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    min_pool_size: Option<i64>,
    #[serde(default)]
    max_pool_size: Option<i64>,
    #[serde(default)]
    expect_usage: Option<u32>,
}

/// A loaded, defaulted template driving one pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolTemplate {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub extra_headers: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub min_pool_size: i64,
    pub max_pool_size: i64,
    /// Percentage of the pool expected to be in use.
    pub expect_usage: u32,
    pub hash: String,
}

impl PoolTemplate {
    /// Builds a template from its parts, applying defaults and computing the
    /// generation hash. Used by the loader and by tests.
    pub fn assemble(
        name: impl Into<String>,
        image: impl Into<String>,
        min_pool_size: Option<i64>,
        max_pool_size: Option<i64>,
        expect_usage: Option<u32>,
        defaults: &TemplateDefaults,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::bad_request("template name cannot be empty"));
        }
        let image = image.into();
        if image.is_empty() {
            return Err(Error::bad_request(format!(
                "template '{name}' must set an image"
            )));
        }

        let min = min_pool_size.unwrap_or(defaults.min_pool_size).max(0);
        let mut max = max_pool_size.unwrap_or(0);
        if max < min {
            max = min * defaults.max_pool_size_factor;
        }
        let expect_usage = expect_usage.unwrap_or(DEFAULT_EXPECT_USAGE).min(100);

        let mut template = Self {
            name,
            image,
            env: BTreeMap::new(),
            extra_headers: BTreeMap::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            min_pool_size: min,
            max_pool_size: max,
            expect_usage,
            hash: String::new(),
        };
        template.rehash()?;
        Ok(template)
    }

    /// Recomputes the generation hash over the serialized pod-template
    /// portion of the spec. Label/annotation hygiene must run first.
    pub fn rehash(&mut self) -> Result<()> {
        #[derive(Serialize)]
        struct HashInput<'a> {
            image: &'a str,
            env: &'a BTreeMap<String, String>,
            extra_headers: &'a BTreeMap<String, String>,
            labels: &'a BTreeMap<String, String>,
        }
        let serialized = serde_json::to_vec(&HashInput {
            image: &self.image,
            env: &self.env,
            extra_headers: &self.extra_headers,
            labels: &self.labels,
        })
        .map_err(|err| Error::internal(format!("failed to serialize template: {err}")))?;
        self.hash = safe_encode(fnv32a(&serialized));
        Ok(())
    }

    /// Labels stamped on every record this template creates.
    pub fn record_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(LABEL_POOL.to_string(), self.name.clone());
        labels.insert(LABEL_TEMPLATE_HASH.to_string(), self.hash.clone());
        labels
    }
}

/// Reads every YAML document under `dir` with kind `SandboxTemplate`.
/// Duplicate template names are rejected.
pub fn load_templates(dir: &Path, defaults: &TemplateDefaults) -> Result<Vec<PoolTemplate>> {
    let mut templates: Vec<PoolTemplate> = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|err| {
        Error::internal(format!("failed to read template dir {}: {err}", dir.display()))
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            Error::internal(format!("failed to read {}: {err}", path.display()))
        })?;
        let file: TemplateFile = serde_yaml::from_str(&raw).map_err(|err| {
            Error::bad_request(format!("invalid template {}: {err}", path.display()))
        })?;
        if file.kind != TEMPLATE_KIND {
            debug!(path = %path.display(), kind = %file.kind, "skipping non-template document");
            continue;
        }

        let mut template = PoolTemplate::assemble(
            file.metadata.name,
            file.spec.image,
            file.spec.min_pool_size,
            file.spec.max_pool_size,
            file.spec.expect_usage,
            defaults,
        )?;
        template.env = file.spec.env;
        template.extra_headers = file.spec.extra_headers;
        template.labels = strip_internal(file.metadata.labels);
        template.annotations = strip_internal(file.metadata.annotations);
        template.rehash()?;

        if templates.iter().any(|t| t.name == template.name) {
            return Err(Error::bad_request(format!(
                "duplicate template '{}' in {}",
                template.name,
                path.display()
            )));
        }
        templates.push(template);
    }

    Ok(templates)
}

/// Drops keys squatting on the manager's own label/annotation space.
fn strip_internal(input: BTreeMap<String, String>) -> BTreeMap<String, String> {
    input
        .into_iter()
        .filter(|(key, _)| {
            !key.starts_with(INTERNAL_LABEL_PREFIX)
                && key != LABEL_POOL
                && key != LABEL_TEMPLATE_HASH
        })
        .collect()
}

/// 32-bit FNV-1a.
pub fn fnv32a(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Encodes a hash with the restricted alphabet so it doubles as a label
/// value.
pub fn safe_encode(mut value: u32) -> String {
    let base = SAFE_ALPHABET.len() as u32;
    if value == 0 {
        return (SAFE_ALPHABET[0] as char).to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(SAFE_ALPHABET[(value % base) as usize]);
        value /= base;
    }
    out.reverse();
    String::from_utf8(out).expect("alphabet is ascii")
}

/// Random suffix for generated record names, drawn from the same alphabet.
pub fn random_suffix(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SAFE_ALPHABET[rng.gen_range(0..SAFE_ALPHABET.len())] as char)
        .collect()
}
