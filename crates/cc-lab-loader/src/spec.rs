use cc_lab_abstract::{HarnessConfig, Scheme, SchemeSelection};

use crate::LoaderError;

/// Split a space-separated scheme list such as `"cubic bbr"`.
pub fn parse_scheme_list(list: &str) -> Vec<String> {
    list.split_whitespace().map(str::to_string).collect()
}

/// Map a user-visible scheme name to the configured scheme.
pub fn scheme_by_name<'a>(
    config: &'a HarnessConfig,
    name: &str,
) -> Result<&'a Scheme, LoaderError> {
    config.scheme(name).ok_or_else(|| LoaderError::UnknownScheme {
        name: name.to_string(),
        known: known_schemes(config),
    })
}

/// Resolve a selection to concrete schemes, in the order the caller asked
/// for them (configuration order for [`SchemeSelection::All`]).
pub fn select_schemes(
    config: &HarnessConfig,
    selection: &SchemeSelection,
) -> Result<Vec<Scheme>, LoaderError> {
    match selection {
        SchemeSelection::All => Ok(config.schemes.clone()),
        SchemeSelection::Named(names) => {
            let mut selected: Vec<Scheme> = Vec::with_capacity(names.len());
            for name in names {
                let scheme = scheme_by_name(config, name)?;
                if !selected.iter().any(|s| s.name == scheme.name) {
                    selected.push(scheme.clone());
                }
            }
            Ok(selected)
        }
    }
}

fn known_schemes(config: &HarnessConfig) -> String {
    config
        .schemes
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
