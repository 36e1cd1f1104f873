//! Sidecar configuration: the sectioned `key = value` file shipped next to
//! each system disk.
//!
//! ```text
//! [vmparameters]
//! memory = 512
//! ostype = "Linux26"
//! ```
//!
//! Only the `vmparameters` section is consumed. Keys become `modifyvm`
//! flags, values are unquoted.

use std::path::Path;

use crate::error::SyncError;

/// Section carrying VM parameters.
pub const VM_PARAMETERS_SECTION: &str = "vmparameters";

/// Ordered `key -> value` parameters for one `modifyvm` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmParameters {
    entries: Vec<(String, String)>,
}

impl VmParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`. Later values win, position of the first
    /// occurrence is kept.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `-key value` pairs in insertion order.
    pub fn to_flags(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(k, v)| [format!("-{k}"), v.clone()])
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VmParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = VmParameters::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// A parsed sidecar file: sections in file order.
#[derive(Debug, Clone, Default)]
pub struct Sidecar {
    sections: Vec<(String, VmParameters)>,
}

impl Sidecar {
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let mut sidecar = Sidecar::default();
        let mut current: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(parse_error(idx, "unterminated section header"));
                };
                let name = name.trim().to_string();
                current = Some(match sidecar.sections.iter().position(|(n, _)| *n == name) {
                    Some(pos) => pos,
                    None => {
                        sidecar.sections.push((name, VmParameters::new()));
                        sidecar.sections.len() - 1
                    }
                });
                continue;
            }

            let Some(section) = current else {
                return Err(parse_error(idx, "entry before the first section header"));
            };
            let Some(sep) = line.find(['=', ':']) else {
                return Err(parse_error(idx, "expected 'key = value'"));
            };
            let key = line[..sep].trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(parse_error(idx, "empty key"));
            }
            sidecar.sections[section].1.insert(key, unquote(&line[sep + 1..]));
        }

        Ok(sidecar)
    }

    pub fn section(&self, name: &str) -> Option<&VmParameters> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, params)| params)
    }
}

/// Read the `vmparameters` section of a sidecar file.
///
/// A file without that section is rejected; the VM would otherwise start
/// with default settings.
pub fn read_vm_parameters(path: &Path) -> Result<VmParameters, SyncError> {
    let text = std::fs::read_to_string(path).map_err(|e| SyncError::Io {
        context: format!("reading sidecar config {}", path.display()),
        source: e,
    })?;
    let sidecar = Sidecar::parse(&text).map_err(|e| match e {
        SyncError::Validation { message } => SyncError::Validation {
            message: format!("{}: {message}", path.display()),
        },
        other => other,
    })?;
    match sidecar.section(VM_PARAMETERS_SECTION) {
        Some(params) => Ok(params.clone()),
        None => Err(SyncError::Validation {
            message: format!(
                "{}: no [{VM_PARAMETERS_SECTION}] section",
                path.display()
            ),
        }),
    }
}

/// Render one section from `key=value` lines, written as given.
pub fn render_section<'a>(name: &str, lines: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = format!("[{name}]\n");
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Strip surrounding whitespace and quote characters.
fn unquote(value: &str) -> String {
    value
        .trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .to_string()
}

fn parse_error(idx: usize, message: &str) -> SyncError {
    SyncError::Validation {
        message: format!("sidecar line {}: {message}", idx + 1),
    }
}
