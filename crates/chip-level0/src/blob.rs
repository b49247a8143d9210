//! Device-independent kernel blobs

use std::collections::HashMap;
use std::sync::Arc;

use chip_ze::ModuleFormat;

use crate::kernel::FunctionInfo;

/// Module binary plus the reflected signature of each kernel it defines
///
/// A blob is immutable and shared by every module created from it.
#[derive(Debug, Clone)]
pub struct KernelBlob {
    binary: Vec<u8>,
    format: ModuleFormat,
    build_flags: String,
    functions: HashMap<String, Arc<FunctionInfo>>,
}

impl KernelBlob {
    /// Blob for an intermediate-language binary
    pub fn new(binary: impl Into<Vec<u8>>) -> Self {
        Self::with_format(binary, ModuleFormat::IlSpirv)
    }

    /// Blob for a binary in `format`
    pub fn with_format(binary: impl Into<Vec<u8>>, format: ModuleFormat) -> Self {
        Self {
            binary: binary.into(),
            format,
            build_flags: String::new(),
            functions: HashMap::new(),
        }
    }

    /// Register the signature of kernel `name`
    pub fn with_function(mut self, name: impl Into<String>, info: FunctionInfo) -> Self {
        self.functions.insert(name.into(), Arc::new(info));
        self
    }

    /// Flags passed to the native compiler
    pub fn with_build_flags(mut self, flags: impl Into<String>) -> Self {
        self.build_flags = flags.into();
        self
    }

    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    pub fn format(&self) -> ModuleFormat {
        self.format
    }

    pub fn build_flags(&self) -> &str {
        &self.build_flags
    }

    /// Signature of kernel `name`
    pub fn function(&self, name: &str) -> Option<Arc<FunctionInfo>> {
        self.functions.get(name).cloned()
    }

    /// Names of every kernel with a signature
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ParamKind;

    #[test]
    fn test_function_lookup() {
        let blob = KernelBlob::new(b"bin".to_vec())
            .with_function("k", FunctionInfo::new([ParamKind::Pointer]))
            .with_build_flags("-O2");
        assert_eq!(blob.function("k").map(|f| f.param_count()), Some(1));
        assert!(blob.function("missing").is_none());
        assert_eq!(blob.format(), ModuleFormat::IlSpirv);
        assert_eq!(blob.build_flags(), "-O2");
        assert_eq!(blob.function_names().collect::<Vec<_>>(), vec!["k"]);
    }
}
