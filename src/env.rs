//! Environment overlay for spawned tasks.

use std::collections::HashMap;

/// Whether the host treats environment variable names case-insensitively.
pub const CASE_INSENSITIVE_ENV: bool = cfg!(windows);

/// Merges `overlay` onto `inherited`, returning the full environment.
///
/// With `case_insensitive`, an overlay key replaces an inherited key that
/// differs only in case, and the inherited spelling is kept. This avoids
/// handing the child both `PATH` and `Path`.
pub fn merge_env<I>(
    inherited: I,
    overlay: &HashMap<String, String>,
    case_insensitive: bool,
) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut merged: Vec<(String, String)> = inherited.into_iter().collect();
    let mut overlay: Vec<(&String, &String)> = overlay.iter().collect();
    overlay.sort();
    for (key, value) in overlay {
        let existing = merged.iter_mut().find(|(name, _)| {
            if case_insensitive {
                name.eq_ignore_ascii_case(key)
            } else {
                name == key
            }
        });
        match existing {
            Some((_, slot)) => *slot = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }
    merged
}

/// Merges `overlay` onto the current process environment.
pub fn merge_process_env(overlay: &HashMap<String, String>) -> Vec<(String, String)> {
    let inherited = std::env::vars_os().map(|(key, value)| {
        (
            key.to_string_lossy().into_owned(),
            value.to_string_lossy().into_owned(),
        )
    });
    merge_env(inherited, overlay, CASE_INSENSITIVE_ENV)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn case_insensitive_overlay_reuses_inherited_key() {
        let inherited = vec![
            ("PATH".to_string(), "Y".to_string()),
            ("HOME".to_string(), "/home/dev".to_string()),
        ];
        let merged = merge_env(inherited, &overlay(&[("Path", "X")]), true);
        let paths: Vec<_> = merged
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("path"))
            .collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0], &("PATH".to_string(), "X".to_string()));
    }

    #[test]
    fn case_sensitive_overlay_keeps_both_spellings() {
        let inherited = vec![("PATH".to_string(), "Y".to_string())];
        let merged = merge_env(inherited, &overlay(&[("Path", "X")]), false);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&("PATH".to_string(), "Y".to_string())));
        assert!(merged.contains(&("Path".to_string(), "X".to_string())));
    }

    #[test]
    fn overlay_adds_new_keys() {
        let merged = merge_env(Vec::new(), &overlay(&[("PORT", "53000")]), true);
        assert_eq!(merged, vec![("PORT".to_string(), "53000".to_string())]);
    }
}
