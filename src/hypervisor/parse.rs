//! Parsers for VBoxManage's human-formatted output.
//!
//! The tool has no structured interface, so these functions are the only
//! place that knows what its text looks like. Errors are plain messages;
//! the adapter attaches the command that produced the text.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::VmId;
use crate::sidecar;

/// Value of a `Key:   value` line.
fn list_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
}

/// Parse `list vms` into `UUID -> name`.
///
/// Accepts the verbose layout (`Name:` followed by `UUID:` lines) and the
/// compact one-line layout (`"name" {uuid}`).
pub fn parse_vm_list(text: &str) -> Result<BTreeMap<VmId, String>, String> {
    let mut vms = BTreeMap::new();
    let mut current_name: Option<String> = None;

    for line in text.lines() {
        if let Some(name) = list_value(line, "Name") {
            current_name = Some(name.to_string());
        } else if let Some(uuid) = list_value(line, "UUID") {
            let Some(name) = current_name.take() else {
                return Err(format!("UUID {uuid} listed without a preceding Name"));
            };
            vms.insert(VmId::new(uuid), name);
        } else if let Some((name, uuid)) = parse_compact_vm_line(line) {
            vms.insert(VmId::new(uuid), name.to_string());
        }
    }

    Ok(vms)
}

fn parse_compact_vm_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim().strip_prefix('"')?;
    let (name, tail) = rest.rsplit_once('"')?;
    let uuid = tail.trim().strip_prefix('{')?.strip_suffix('}')?;
    Some((name, uuid))
}

/// Parse `list hdds` into the set of registered media locations.
pub fn parse_media_locations(text: &str) -> BTreeSet<PathBuf> {
    text.lines()
        .filter_map(|line| list_value(line, "Location"))
        .filter(|loc| !loc.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Extract the UUID printed by `createvm ... -register`.
pub fn parse_created_uuid(text: &str) -> Option<VmId> {
    text.lines()
        .find_map(|line| list_value(line, "UUID"))
        .filter(|uuid| !uuid.is_empty())
        .map(VmId::new)
}

/// What happens to a `showvminfo -machinereadable` line when it is turned
/// into reusable VM parameters.
enum KeyRule {
    Drop,
    Rename(&'static str),
}

/// Rules match by line prefix. Identity and runtime state are dropped, as
/// are the disk slots (attachments are managed separately).
const VMINFO_KEY_RULES: &[(&str, KeyRule)] = &[
    ("name", KeyRule::Drop),
    ("UUID", KeyRule::Drop),
    ("CfgFile", KeyRule::Drop),
    ("VMState", KeyRule::Drop),
    ("VMStateChangeTime", KeyRule::Drop),
    ("GuestStatisticsUpdateInterval", KeyRule::Drop),
    ("bootmenu", KeyRule::Rename("biosbootmenu")),
    ("hda", KeyRule::Drop),
    ("hdb", KeyRule::Drop),
    ("hdc", KeyRule::Drop),
    ("hdd", KeyRule::Drop),
];

/// Rewrite machine-readable VM info into a `[vmparameters]` section.
///
/// Kept lines are copied exactly as the tool printed them, quoted keys
/// included; only renamed prefixes change.
pub fn vminfo_to_parameters(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();

    for line in text.lines().filter(|l| !l.is_empty()) {
        let rule = VMINFO_KEY_RULES
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix));
        match rule {
            Some((_, KeyRule::Drop)) => continue,
            Some((prefix, KeyRule::Rename(to))) => {
                lines.push(format!("{to}{}", &line[prefix.len()..]))
            }
            None => lines.push(line.to_string()),
        }
    }

    sidecar::render_section(
        sidecar::VM_PARAMETERS_SECTION,
        lines.iter().map(String::as_str),
    )
}
