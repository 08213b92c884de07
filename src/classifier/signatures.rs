//! Error signature matching over message attributes.

use super::FailureKind;

/// A signature that matched, and which category it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub kind: FailureKind,
    pub signature: String,
}

/// Case-insensitive substring signatures for transient and poison failures
///
/// Poison signatures are checked first: an error text mentioning both
/// "timeout" and "schema" is not something a retry fixes.
#[derive(Debug, Clone, Default)]
pub struct SignatureSet {
    transient: Vec<String>,
    poison: Vec<String>,
}

impl SignatureSet {
    pub fn new<T, P>(transient: T, poison: P) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        Self {
            transient: normalize(transient),
            poison: normalize(poison),
        }
    }

    pub fn match_text(&self, text: &str) -> Option<SignatureMatch> {
        let text = text.to_lowercase();
        if text.trim().is_empty() {
            return None;
        }

        let find = |signatures: &[String], kind: FailureKind| {
            signatures
                .iter()
                .find(|sig| text.contains(sig.as_str()))
                .map(|sig| SignatureMatch {
                    kind,
                    signature: sig.clone(),
                })
        };

        find(&self.poison, FailureKind::Poison).or_else(|| find(&self.transient, FailureKind::Transient))
    }

    pub fn is_empty(&self) -> bool {
        self.transient.is_empty() && self.poison.is_empty()
    }
}

fn normalize<I>(signatures: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    signatures
        .into_iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
