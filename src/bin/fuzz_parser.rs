#[cfg(fuzzing)]
use honggfuzz::fuzz;
use silica::{compiler, parser, runtime::Runtime};

#[cfg(fuzzing)]
fn main() {
    env_logger::init();
    loop {
        fuzz!(|data: &[u8]| { test_once(data) });
    }
}

/// Lex, parse and generate code for arbitrary input. Nothing is executed.
fn test_once(data: &[u8]) {
    if let Ok(src) = std::str::from_utf8(data) {
        let ast = parser::parse_ast(src);
        if ast.error_count() > 0 {
            let _ = ast.diagnostic_text();
            return;
        }
        let mut runtime = Runtime::new(std::io::sink(), std::io::empty());
        if let Ok(program) = compiler::generate(&ast, &mut runtime) {
            assert!(program.links.iter().all(|l| l.pointee_section < program.sections.len()));
        }
    }
}

#[cfg(not(fuzzing))]
fn main() {
    // Keep the harness compiled outside of fuzzing builds
    let _ = test_once;
}
