/// Code generation options.
#[derive(Debug, Clone)]
pub struct CodegenConfig {
    /// Trap with `crash 1` before dereferencing a null pointer.
    pub null_checks: bool,
    /// Run the peephole optimizer during emission and before linking.
    pub optimize: bool,
    /// Widest single memory transfer, in bytes.
    pub pointer_width: u64,
    /// Frame size in bytes above which a warning is reported.
    pub stack_warning_limit: u64,
    /// Attach line, scope and function tables to the output.
    pub debug_info: bool,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        CodegenConfig {
            null_checks: true,
            optimize: true,
            pointer_width: 8,
            stack_warning_limit: 16 * 1024,
            debug_info: true,
        }
    }
}
