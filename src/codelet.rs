//! Codelet definitions.
//!
//! A [`Codelet`] is a kernel that passed intrinsic binding and verification.
//! Its spec is frozen behind an `Arc` and identified by the blake3 hash of
//! its canonical text, which keys every cache downstream.

use std::fmt;
use std::sync::Arc;

use crate::core::error::VerificationError;
use crate::intrinsics;
use crate::kernel::display::canonical_text;
use crate::kernel::{FieldDecl, KernelSpec};
use crate::verify::verify;

/// A verified, immutable kernel.
#[derive(Debug, Clone)]
pub struct Codelet {
    spec: Arc<KernelSpec>,
    fingerprint: String,
}

/// Bind intrinsics, verify and freeze `spec`.
///
/// Nothing is produced for a spec that fails verification.
pub fn define_codelet(mut spec: KernelSpec) -> Result<Codelet, VerificationError> {
    intrinsics::bind(&mut spec);
    verify(&spec)?;

    let fingerprint = blake3::hash(canonical_text(&spec).as_bytes()).to_hex().to_string();
    log::debug!("defined codelet `{}` ({})", spec.name(), &fingerprint[..16]);
    Ok(Codelet {
        spec: Arc::new(spec),
        fingerprint,
    })
}

impl Codelet {
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn fields(&self) -> &[FieldDecl] {
        self.spec.fields()
    }

    /// Hex blake3 digest of the canonical kernel text.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl PartialEq for Codelet {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for Codelet {}

impl fmt::Display for Codelet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), &self.fingerprint[..12])
    }
}
