//! C1: Argument Filter.
//!
//! Strips options that do not apply to the active CLI version. Filtering is
//! total and pure: every input produces an output, nothing here ever fails.
//! It is also idempotent and deterministic: `filter(filter(x)) == filter(x)`,
//! and two calls given the same input always produce bit-identical output,
//! since both properties are relied on by the fingerprint
//! (`fingerprint::fingerprint`) and by the batching law in the scheduler.
//!
//! Shape validation — rejecting a value `OptionName` could never legally
//! carry — is a *separate* concern, deliberately not performed here; see
//! `pool::validate_shapes`, which calls [`shape_is_valid`] directly. Keeping
//! it out of `filter_options` is what lets this module stay total.

use std::collections::BTreeSet;

use tailwind_pool_proto::{CliVersion, OptionName, OptionValue, RequestOptions};

/// Returns whether `name` is meaningful for `version`.
fn applies_to(version: CliVersion, name: OptionName) -> bool {
    use OptionName::*;
    match name {
        InputPath | OutputPath | Minify | Watch => true,
        ContentGlobs | ConfigPath | Postcss | Poll | NoAutoprefixer => version == CliVersion::V3,
        Optimize | WorkingDir | SourceMap => version == CliVersion::V4,
    }
}

/// Returns whether `value` is a shape `name` can legally carry.
pub(crate) fn shape_is_valid(name: OptionName, value: &OptionValue) -> bool {
    use OptionName::*;
    use OptionValue::*;
    match (name, value) {
        (InputPath | OutputPath | ConfigPath | WorkingDir, Str(_)) => true,
        (ContentGlobs, List(_)) => true,
        (Postcss | Poll | NoAutoprefixer | Minify | Watch | Optimize | SourceMap, Bool(_)) => true,
        _ => false,
    }
}

/// Returns whether `option` is supported at all under `version`, regardless
/// of the value it would be given.
pub fn is_supported(option: OptionName, version: CliVersion) -> bool {
    applies_to(version, option)
}

/// Returns every option name supported under `version`.
pub fn supported(version: CliVersion) -> BTreeSet<OptionName> {
    use OptionName::*;
    [
        InputPath,
        OutputPath,
        Minify,
        Watch,
        ContentGlobs,
        ConfigPath,
        Postcss,
        Poll,
        NoAutoprefixer,
        Optimize,
        WorkingDir,
        SourceMap,
    ]
    .into_iter()
    .filter(|&name| applies_to(version, name))
    .collect()
}

/// Drops every option that does not apply to `version`.
///
/// The `BTreeMap` backing `RequestOptions` already keeps iteration in
/// canonical key order, so the result needs no further sorting before it is
/// handed to [`crate::fingerprint::fingerprint`] or rendered into argv.
///
/// Total and infallible: an option this function cannot carry forward is
/// simply dropped, never an error. A caller that needs to reject a bad value
/// shape outright wants `pool::validate_shapes`, run *before* filtering.
pub fn filter_options(version: CliVersion, options: &RequestOptions) -> RequestOptions {
    options
        .iter()
        .filter(|(&name, _)| applies_to(version, name))
        .map(|(&name, value)| (name, value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(OptionName, OptionValue)]) -> RequestOptions {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn drops_v3_only_options_under_v4() {
        let input = opts(&[
            (OptionName::InputPath, OptionValue::Str("in.css".into())),
            (OptionName::Poll, OptionValue::Bool(true)),
        ]);
        let filtered = filter_options(CliVersion::V4, &input);
        assert!(!filtered.contains_key(&OptionName::Poll));
        assert!(filtered.contains_key(&OptionName::InputPath));
    }

    #[test]
    fn drops_v4_only_options_under_v3() {
        let input = opts(&[(OptionName::Optimize, OptionValue::Bool(true))]);
        let filtered = filter_options(CliVersion::V3, &input);
        assert!(filtered.is_empty());
    }

    #[test]
    fn is_idempotent() {
        let input = opts(&[
            (OptionName::InputPath, OptionValue::Str("in.css".into())),
            (OptionName::Minify, OptionValue::Bool(true)),
            (OptionName::ContentGlobs, OptionValue::List(vec!["**/*.html".into()])),
        ]);
        let once = filter_options(CliVersion::V3, &input);
        let twice = filter_options(CliVersion::V3, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn never_errors_on_a_bad_shape() {
        // filter_options keeps a Minify option even with a shape the
        // subprocess couldn't accept; that rejection is validate_shapes's
        // job, not this function's.
        let input = opts(&[(OptionName::Minify, OptionValue::Str("yes".into()))]);
        let filtered = filter_options(CliVersion::V4, &input);
        assert!(filtered.contains_key(&OptionName::Minify));
    }

    #[test]
    fn is_supported_matches_applies_to() {
        assert!(is_supported(OptionName::Optimize, CliVersion::V4));
        assert!(!is_supported(OptionName::Optimize, CliVersion::V3));
    }

    #[test]
    fn supported_excludes_other_version_only_options() {
        let v3 = supported(CliVersion::V3);
        assert!(v3.contains(&OptionName::Poll));
        assert!(!v3.contains(&OptionName::Optimize));
    }
}
