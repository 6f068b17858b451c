//! Build result predicates: package version conditions, image version
//! conditions, and the disallow filters.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Deserialize;

/// One entry of a job's `conditions` list. With a `package_name` it
/// constrains that package's version/release in the build; without one it
/// constrains the image version itself.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub package_name: Option<String>,
    pub version: Option<String>,
    pub release: Option<String>,
    #[serde(default = "default_condition")]
    pub condition: String,
}

fn default_condition() -> String {
    ">=".to_string()
}

/// Package metadata parsed from the build's `.packages` file, one line per
/// package: `name|version|release|license` (extra fields tolerated).
#[derive(Debug, Clone, PartialEq)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub release: String,
    pub license: String,
}

pub fn parse_packages_file(content: &str) -> HashMap<String, PackageInfo> {
    let mut packages = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 2 || fields[0].is_empty() {
            continue;
        }
        let info = PackageInfo {
            name: fields[0].to_string(),
            version: fields.get(1).copied().unwrap_or_default().to_string(),
            release: fields.get(2).copied().unwrap_or_default().to_string(),
            license: fields.get(3).copied().unwrap_or_default().to_string(),
        };
        packages.insert(info.name.clone(), info);
    }
    packages
}

/// Compare dotted version strings segment by segment, numerically where
/// both segments are numbers.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left_parts: Vec<&str> = left.split(['.', '-']).collect();
    let right_parts: Vec<&str> = right.split(['.', '-']).collect();

    for index in 0..left_parts.len().max(right_parts.len()) {
        let a = left_parts.get(index).copied().unwrap_or("0");
        let b = right_parts.get(index).copied().unwrap_or("0");

        let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.cmp(b),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn ordering_matches(op: &str, ordering: Ordering) -> bool {
    match op {
        ">=" => ordering != Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        "==" => ordering == Ordering::Equal,
        ">" => ordering == Ordering::Greater,
        "<" => ordering == Ordering::Less,
        _ => false,
    }
}

/// Check every condition against the image version and package list.
/// Returns the failures; an empty list means the build qualifies.
pub fn evaluate_conditions(
    conditions: &[Condition],
    image_version: &str,
    packages: &HashMap<String, PackageInfo>,
) -> Vec<String> {
    let mut failures = Vec::new();

    for condition in conditions {
        match &condition.package_name {
            Some(package_name) => {
                let Some(package) = packages.get(package_name) else {
                    failures.push(format!("package {package_name} not in build"));
                    continue;
                };
                if let Some(version) = &condition.version {
                    let ordering = compare_versions(&package.version, version);
                    if !ordering_matches(&condition.condition, ordering) {
                        failures.push(format!(
                            "package {package_name} version {} fails {} {version}",
                            package.version, condition.condition
                        ));
                        continue;
                    }
                }
                if let Some(release) = &condition.release {
                    let ordering = compare_versions(&package.release, release);
                    if !ordering_matches(&condition.condition, ordering) {
                        failures.push(format!(
                            "package {package_name} release {} fails {} {release}",
                            package.release, condition.condition
                        ));
                    }
                }
            }
            None => {
                if let Some(version) = &condition.version {
                    let ordering = compare_versions(image_version, version);
                    if !ordering_matches(&condition.condition, ordering) {
                        failures.push(format!(
                            "image version {image_version} fails {} {version}",
                            condition.condition
                        ));
                    }
                }
            }
        }
    }

    failures
}

/// `*`-wildcard match, the only pattern syntax the disallow lists use.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut remaining = text;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match remaining.strip_prefix(part) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(at) => remaining = &remaining[at + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'
    true
}

/// Apply `disallow_licenses`/`disallow_packages`. Returns the offending
/// packages; an empty list means the build is acceptable.
pub fn evaluate_disallows(
    packages: &HashMap<String, PackageInfo>,
    disallow_licenses: &[String],
    disallow_packages: &[String],
) -> Vec<String> {
    let mut offenders = Vec::new();

    for package in packages.values() {
        if disallow_packages
            .iter()
            .any(|pattern| glob_match(pattern, &package.name))
        {
            offenders.push(format!("package {} is disallowed", package.name));
            continue;
        }
        if disallow_licenses
            .iter()
            .any(|pattern| glob_match(pattern, &package.license))
        {
            offenders.push(format!(
                "package {} license {} is disallowed",
                package.name, package.license
            ));
        }
    }

    offenders.sort();
    offenders
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn packages() -> HashMap<String, PackageInfo> {
        parse_packages_file(
            "openssl|4.13.1|1.1|OpenSSL\n\
             kernel-default|5.14.21|150500.55.39|GPL-2.0-only\n\
             patterns-base-mini|1.0|1.1|MIT\n",
        )
    }

    #[test]
    fn test_parse_packages_file() {
        let packages = packages();
        assert_eq!(packages.len(), 3);
        let openssl = &packages["openssl"];
        assert_eq!(openssl.version, "4.13.1");
        assert_eq!(openssl.release, "1.1");
        assert_eq!(openssl.license, "OpenSSL");
    }

    #[test]
    fn test_version_comparison() {
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("4.13", "4.13.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "10.0"), Ordering::Less);
    }

    #[test]
    fn test_package_condition_met() {
        let conditions = vec![Condition {
            package_name: Some("openssl".into()),
            version: Some("4.13.1".into()),
            release: None,
            condition: ">=".into(),
        }];
        assert!(evaluate_conditions(&conditions, "1.0.0", &packages()).is_empty());
    }

    #[test]
    fn test_package_condition_failed() {
        let conditions = vec![Condition {
            package_name: Some("openssl".into()),
            version: Some("5.0".into()),
            release: None,
            condition: ">=".into(),
        }];
        let failures = evaluate_conditions(&conditions, "1.0.0", &packages());
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("openssl"));
    }

    #[test]
    fn test_missing_package_fails() {
        let conditions = vec![Condition {
            package_name: Some("nothere".into()),
            version: None,
            release: None,
            condition: ">=".into(),
        }];
        let failures = evaluate_conditions(&conditions, "1.0.0", &packages());
        assert_eq!(failures, vec!["package nothere not in build"]);
    }

    #[test]
    fn test_image_version_condition() {
        let conditions = vec![Condition {
            package_name: None,
            version: Some("1.42.1".into()),
            release: None,
            condition: ">=".into(),
        }];
        assert!(evaluate_conditions(&conditions, "1.42.2", &packages()).is_empty());
        assert!(!evaluate_conditions(&conditions, "1.42.0", &packages()).is_empty());
    }

    #[test]
    fn test_condition_deserializes_with_default_op() {
        let condition: Condition =
            serde_json::from_value(json!({"package_name": "openssl", "version": "1.0"}))
                .unwrap();
        assert_eq!(condition.condition, ">=");
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*-mini", "patterns-base-mini"));
        assert!(glob_match("GPL*", "GPL-2.0-only"));
        assert!(glob_match("openssl", "openssl"));
        assert!(!glob_match("*-mini", "kernel-default"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn test_disallows() {
        let offenders = evaluate_disallows(
            &packages(),
            &["MIT".to_string()],
            &["*-mini".to_string()],
        );
        // The -mini package trips the package filter before its license
        assert_eq!(offenders, vec!["package patterns-base-mini is disallowed"]);

        let offenders = evaluate_disallows(&packages(), &["GPL*".to_string()], &[]);
        assert_eq!(offenders.len(), 1);
        assert!(offenders[0].contains("kernel-default"));
    }
}
