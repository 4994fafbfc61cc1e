// 🔎 Error Classifier - benign "key not present" vs genuine faults
//
// Two shapes of fault reach the sync layer:
// - structured: an EngineError somewhere in the chain, carrying a code
// - plain: any other error whose message contains the marker text
// Everything unrecognized classifies as Unclassified, which always propagates.

use crate::error::{EngineError, ErrorCode, MISSING_KEY_MARKER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Entity was never inserted into the structure
    MissingKey,

    /// Identifier minting gave up
    ExhaustedRetries,

    /// Malformed sync input
    Validation,

    /// Any other store fault
    Unclassified,
}

/// True when the fault means "key not present", by code or by marker text.
pub fn is_missing_key_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let structured = cause
            .downcast_ref::<EngineError>()
            .map(|e| e.code() == ErrorCode::MissingKey)
            .unwrap_or(false);

        structured || cause.to_string().contains(MISSING_KEY_MARKER)
    })
}

/// Map a fault onto the engine's error taxonomy.
pub fn classify(err: &anyhow::Error) -> FaultClass {
    if is_missing_key_error(err) {
        return FaultClass::MissingKey;
    }

    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map(EngineError::code);

    match code {
        Some(ErrorCode::ExhaustedRetries) => FaultClass::ExhaustedRetries,
        Some(ErrorCode::Validation) => FaultClass::Validation,
        _ => FaultClass::Unclassified,
    }
}
