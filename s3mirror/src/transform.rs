//! Key transformation pipeline: remote object keys are opaque strings, and
//! this module turns them into relative paths the host file system agrees
//! with. The same pipeline runs over local entry names before sorting, so
//! both sides of the reconciler compare like with like.

use std::fmt;

use unicode_normalization::UnicodeNormalization;

/// Which separator the host file system uses and which one counts as
/// foreign. Computed once at start-up and passed into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    pub dir_separator: char,
    pub foreign_separator: char,
}

impl PlatformProfile {
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::windows()
        } else {
            Self::posix()
        }
    }

    pub fn posix() -> Self {
        Self {
            dir_separator: '/',
            foreign_separator: '\\',
        }
    }

    pub fn windows() -> Self {
        Self {
            dir_separator: '\\',
            foreign_separator: '/',
        }
    }
}

/// Unicode normalization forms, selectable through configuration. The same
/// form must be applied to remote keys and local entries, otherwise
/// canonically-equal names fail to line up in the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UnicodeForm {
    Nfc,
    Nfd,
    Nfkc,
    Nfkd,
}

impl fmt::Display for UnicodeForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nfc => "nfc",
            Self::Nfd => "nfd",
            Self::Nfkc => "nfkc",
            Self::Nfkd => "nfkd",
        })
    }
}

/// One step of the pipeline. Every transform is a pure `string -> string`
/// function and idempotent: applying it twice equals applying it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransform {
    /// Repeatedly strips a leading separator or a Windows drive prefix
    /// (`C:\`, `d:/`) until neither remains, so keys cannot escape the
    /// mirror root.
    StripRootPrefix,
    /// Replaces the foreign separator with the host's, so directory
    /// boundaries in keys match the file system's notion of "directory".
    NormalizeSeparators(PlatformProfile),
    UnicodeNormalize(UnicodeForm),
}

impl KeyTransform {
    pub fn apply(&self, key: &str) -> String {
        match self {
            KeyTransform::StripRootPrefix => {
                let mut rest = key;
                loop {
                    if let Some(stripped) = rest.strip_prefix(['/', '\\']) {
                        rest = stripped;
                    } else if let Some(stripped) = strip_drive_prefix(rest) {
                        rest = stripped;
                    } else {
                        break;
                    }
                }
                rest.to_owned()
            }
            KeyTransform::NormalizeSeparators(profile) => {
                key.replace(profile.foreign_separator, &profile.dir_separator.to_string())
            }
            KeyTransform::UnicodeNormalize(form) => match form {
                UnicodeForm::Nfc => key.nfc().collect(),
                UnicodeForm::Nfd => key.nfd().collect(),
                UnicodeForm::Nfkc => key.nfkc().collect(),
                UnicodeForm::Nfkd => key.nfkd().collect(),
            },
        }
    }
}

/// `[A-Za-z]:[/\]` at the start of the key.
fn strip_drive_prefix(key: &str) -> Option<&str> {
    let mut chars = key.chars();
    let drive = chars.next()?;
    if !drive.is_ascii_alphabetic() {
        return None;
    }
    if chars.next()? != ':' {
        return None;
    }
    let separator = chars.next()?;
    if separator != '/' && separator != '\\' {
        return None;
    }
    Some(chars.as_str())
}

/// Configuration-bound ordered sequence of transforms, applied left to
/// right.
#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    transforms: Vec<KeyTransform>,
}

impl TransformPipeline {
    pub fn new(transforms: Vec<KeyTransform>) -> Self {
        Self { transforms }
    }

    pub fn apply(&self, key: &str) -> String {
        let mut current = key.to_owned();
        for transform in &self.transforms {
            current = transform.apply(&current);
        }
        current
    }

    /// Transformed keys that no longer name anything below the mirror
    /// root, or that could name something outside it. Such keys are
    /// dropped by both listing producers and by the notification ingress.
    pub fn is_dropped(transformed_key: &str) -> bool {
        if transformed_key.is_empty() || transformed_key == "/" || transformed_key == "\\" {
            return true;
        }
        // A ".." segment would let a key reach targets outside the mirror
        // root; object keys have no business containing one.
        transformed_key
            .split(['/', '\\'])
            .any(|segment| segment == "..")
    }
}
