//! Link configuration consumed by the writer.

use std::fmt;
use std::path::PathBuf;

use crate::format::Export;

/// Predicate deciding whether a planned export is retained.
pub type ExportFilter = Box<dyn Fn(&Export) -> bool + Send + Sync>;

/// Options controlling output shape. Populated by the driver; the writer
/// treats this as frozen input apart from the relocatable global-base
/// override.
pub struct LinkConfig {
    /// Destination path of the module binary.
    pub output_file: PathBuf,
    /// Emit linking + reloc sections, skip ctor synthesis, export nothing.
    pub relocatable: bool,
    /// Import "env.memory" instead of defining memory.
    pub import_memory: bool,
    /// Import "env.__indirect_function_table" instead of defining it.
    pub import_table: bool,
    /// Export the defined indirect function table.
    pub export_table: bool,
    /// Export hidden symbols too.
    pub export_all: bool,
    /// Drop `.debug_*` custom sections and the name section.
    pub strip_debug: bool,
    pub strip_all: bool,
    /// Coalesce `.text.*`, `.data.*`, `.bss.*` into their common prefix.
    pub merge_data_segments: bool,
    /// Virtual address of the first data byte.
    pub global_base: u32,
    /// Reserved stack size; must be a multiple of 16.
    pub z_stack_size: u32,
    /// Place the stack below static data.
    pub stack_first: bool,
    /// Module memory limits in bytes, page-aligned. Zero means unset.
    pub initial_memory: u32,
    pub max_memory: u32,
    /// Final filter over the collected export list.
    pub should_export: Option<ExportFilter>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            output_file: PathBuf::from("a.out.wasm"),
            relocatable: false,
            import_memory: false,
            import_table: false,
            export_table: false,
            export_all: false,
            strip_debug: false,
            strip_all: false,
            merge_data_segments: false,
            global_base: 0,
            z_stack_size: 0,
            stack_first: false,
            initial_memory: 0,
            max_memory: 0,
            should_export: None,
        }
    }
}

impl LinkConfig {
    pub fn strip_names(&self) -> bool {
        self.strip_debug || self.strip_all
    }

    pub fn retains_export(&self, export: &Export) -> bool {
        match &self.should_export {
            Some(filter) => filter(export),
            None => true,
        }
    }
}

impl fmt::Debug for LinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkConfig")
            .field("output_file", &self.output_file)
            .field("relocatable", &self.relocatable)
            .field("import_memory", &self.import_memory)
            .field("import_table", &self.import_table)
            .field("export_table", &self.export_table)
            .field("export_all", &self.export_all)
            .field("strip_debug", &self.strip_debug)
            .field("strip_all", &self.strip_all)
            .field("merge_data_segments", &self.merge_data_segments)
            .field("global_base", &self.global_base)
            .field("z_stack_size", &self.z_stack_size)
            .field("stack_first", &self.stack_first)
            .field("initial_memory", &self.initial_memory)
            .field("max_memory", &self.max_memory)
            .field("should_export", &self.should_export.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ExportKind;

    #[test]
    fn test_retains_export() {
        let mut config = LinkConfig::default();
        let export = Export {
            name: "foo".to_string(),
            kind: ExportKind::Function,
            index: 0,
        };
        assert!(config.retains_export(&export));
        config.should_export = Some(Box::new(|e| e.name != "foo"));
        assert!(!config.retains_export(&export));
    }
}
