//! C2: Fingerprint.
//!
//! A fingerprint is the scheduler's notion of "two requests can share a
//! warm worker." It is computed over the *filtered* options (see
//! [`crate::filter`]) so a request carrying an option the active CLI
//! version ignores hashes identically to one that never carried it at all.
//!
//! `OutputPath` is deliberately excluded: it names a destination for the
//! result, not an input that changes how the subprocess must be launched or
//! configured, so two requests differing only in where the caller wants the
//! CSS written still belong on the same worker. Every other surviving
//! option participates, including `InputPath`, which does select the
//! subprocess's invocation arguments.

use tailwind_pool_proto::{CliVersion, Fingerprint, OptionName, OptionValue, RequestOptions};
use xxhash_rust::xxh3::Xxh3;

fn hash_value(hasher: &mut Xxh3, value: &OptionValue) {
    match value {
        OptionValue::Str(s) => {
            hasher.update(&[0u8]);
            hasher.update(s.as_bytes());
        }
        OptionValue::Bool(b) => {
            hasher.update(&[1u8, *b as u8]);
        }
        OptionValue::List(items) => {
            hasher.update(&[2u8]);
            for item in items {
                hasher.update(item.as_bytes());
                hasher.update(&[0u8]);
            }
        }
    }
}

/// Computes a [`Fingerprint`] for `filtered`, which must already have passed
/// through [`crate::filter::filter_options`] for `version`.
///
/// `RequestOptions` is a `BTreeMap`, so iteration here is always in
/// canonical key order: the same set of options produces the same
/// fingerprint regardless of the order the caller inserted them in.
pub fn fingerprint(version: CliVersion, filtered: &RequestOptions) -> Fingerprint {
    let mut hasher = Xxh3::new();
    hasher.update(match version {
        CliVersion::V3 => b"v3",
        CliVersion::V4 => b"v4",
    });
    for (name, value) in filtered.iter() {
        if *name == OptionName::OutputPath {
            continue;
        }
        hasher.update(&(*name as u8).to_le_bytes());
        hash_value(&mut hasher, value);
    }
    Fingerprint(hasher.digest())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(OptionName, OptionValue)]) -> RequestOptions {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn stable_across_insertion_order() {
        let a = opts(&[
            (OptionName::InputPath, OptionValue::Str("a.css".into())),
            (OptionName::Minify, OptionValue::Bool(true)),
        ]);
        let b = opts(&[
            (OptionName::Minify, OptionValue::Bool(true)),
            (OptionName::InputPath, OptionValue::Str("a.css".into())),
        ]);
        assert_eq!(fingerprint(CliVersion::V4, &a), fingerprint(CliVersion::V4, &b));
    }

    #[test]
    fn ignores_output_path() {
        let a = opts(&[(OptionName::OutputPath, OptionValue::Str("out1.css".into()))]);
        let b = opts(&[(OptionName::OutputPath, OptionValue::Str("out2.css".into()))]);
        assert_eq!(fingerprint(CliVersion::V4, &a), fingerprint(CliVersion::V4, &b));
    }

    #[test]
    fn distinguishes_differing_inputs() {
        let a = opts(&[(OptionName::InputPath, OptionValue::Str("a.css".into()))]);
        let b = opts(&[(OptionName::InputPath, OptionValue::Str("b.css".into()))]);
        assert_ne!(fingerprint(CliVersion::V4, &a), fingerprint(CliVersion::V4, &b));
    }

    #[test]
    fn distinguishes_cli_version() {
        let a = opts(&[]);
        assert_ne!(fingerprint(CliVersion::V3, &a), fingerprint(CliVersion::V4, &a));
    }
}
