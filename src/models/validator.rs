use std::path::Path;

/// Components every usable model directory must provide
pub const REQUIRED_COMPONENTS: &[&str] = &["MelSpectrogram", "AudioEncoder", "TextDecoder"];

/// Extension of a compiled model package
pub const COMPILED_EXT: &str = "mlmodelc";

/// Extension of an uncompiled model package
pub const PACKAGE_EXT: &str = "mlpackage";

/// Weights file expected inside an uncompiled package
const PACKAGE_WEIGHTS: &[&str] = &["Data", "com.apple.CoreML", "weights", "weight.bin"];

/// Whether `directory` holds a complete model.
///
/// Each required component counts when either `<component>.mlmodelc` exists or
/// `<component>.mlpackage` contains its weights file. Partial artifacts are
/// rejected.
#[must_use]
pub fn is_complete(directory: &Path) -> bool {
    directory.is_dir()
        && REQUIRED_COMPONENTS
            .iter()
            .all(|component| component_present(directory, component))
}

/// Components with neither accepted layout present
#[must_use]
pub fn missing_components(directory: &Path) -> Vec<&'static str> {
    REQUIRED_COMPONENTS
        .iter()
        .copied()
        .filter(|component| !component_present(directory, component))
        .collect()
}

/// Whether a path is the inside of a model package (never a model candidate)
#[must_use]
pub fn is_package_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == COMPILED_EXT || ext == PACKAGE_EXT)
}

fn component_present(directory: &Path, component: &str) -> bool {
    if directory.join(format!("{component}.{COMPILED_EXT}")).exists() {
        return true;
    }

    let weights = PACKAGE_WEIGHTS.iter().fold(
        directory.join(format!("{component}.{PACKAGE_EXT}")),
        |path, part| path.join(part),
    );
    weights.is_file()
}
