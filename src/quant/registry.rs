//! Process-local quantizer factory registry.
//!
//! Built-in factories (product, scalar) are installed on first use. The
//! registry is append-only at runtime: duplicate registration fails so a
//! plugin cannot silently shadow a built-in. Tests that register their own
//! factories call [`reset_for_testing`] to avoid cross-test contamination.

use super::{
    ProductQuantizer, QuantizationError, QuantizationKind, Quantizer, QuantizerConfig,
    ScalarQuantizer,
};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Constructs a quantizer from a validated configuration.
pub type QuantizerFactory =
    fn(&QuantizerConfig) -> Result<Box<dyn Quantizer>, QuantizationError>;

static REGISTRY: OnceLock<Mutex<HashMap<QuantizationKind, QuantizerFactory>>> = OnceLock::new();

fn builtin_map() -> HashMap<QuantizationKind, QuantizerFactory> {
    let mut map: HashMap<QuantizationKind, QuantizerFactory> = HashMap::new();
    map.insert(QuantizationKind::Product, |cfg| {
        Ok(Box::new(ProductQuantizer::new(cfg)?))
    });
    map.insert(QuantizationKind::Scalar, |cfg| {
        Ok(Box::new(ScalarQuantizer::new(cfg)?))
    });
    map
}

fn registry() -> &'static Mutex<HashMap<QuantizationKind, QuantizerFactory>> {
    REGISTRY.get_or_init(|| Mutex::new(builtin_map()))
}

/// Registers a factory for `kind`. Fails if one is already present.
pub fn register(
    kind: QuantizationKind,
    factory: QuantizerFactory,
) -> Result<(), QuantizationError> {
    let mut map = registry()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if map.contains_key(&kind) {
        return Err(QuantizationError::DuplicateFactory(kind));
    }
    map.insert(kind, factory);
    Ok(())
}

/// Validates `config` and constructs a quantizer via the registered factory.
pub fn create(config: &QuantizerConfig) -> Result<Box<dyn Quantizer>, QuantizationError> {
    config.validate()?;
    let factory = {
        let map = registry()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(&config.kind)
            .copied()
            .ok_or(QuantizationError::UnknownKind(config.kind))?
    };
    factory(config)
}

/// Restores the registry to the built-in factories only.
///
/// Intended for tests; production code should treat the registry as
/// append-only after startup.
pub fn reset_for_testing() {
    let mut map = registry()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *map = builtin_map();
}
