use anyhow::Context;
use silica::{cmdline::RunCmd, compiler, executor, parser, runtime::Runtime};
use structopt::StructOpt;
use tap::TapFallible;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cmd = RunCmd::from_args();

    let code = std::fs::read_to_string(&cmd.in_file)
        .with_context(|| format!("Could not read {}", cmd.in_file.display()))?;

    // Parse to abstract syntax tree
    let ast = match parser::parse(&code).tap_ok(|ast| {
        log::debug!("parsed {} functions from {}", ast.functions.len(), cmd.in_file.display())
    }) {
        Ok(ast) => ast,
        Err(diagnostics) => {
            for d in &diagnostics {
                eprintln!("{}\n", d);
            }
            let errors = diagnostics.iter().filter(|d| d.is_error()).count();
            anyhow::bail!("Compilation failed with {} errors", errors);
        }
    };
    silica::check_entry(&ast, &cmd.entry)?;

    if cmd.emit_ast {
        println!("{}", serde_json::to_string_pretty(&ast)?);
    }

    let mut runtime = Runtime::stdio();
    let value = {
        let mut program = compiler::generate(&ast, &mut runtime)?;
        if cmd.emit_code {
            for (name, (section, _)) in &program.functions {
                let data = &program.sections[*section].data;
                println!("{} (section {}): {}", name, section, hex::encode(data));
            }
            for link in &program.links {
                println!("{:?}", link);
            }
        }

        let entry = program
            .entry(&cmd.entry)
            .with_context(|| format!("No function named {}", cmd.entry))?;
        let image = executor::load(&mut program.sections, &program.links)?;
        // Safety: the code was generated against `runtime`, which is still alive
        unsafe { image.execute(entry)? }
    };
    runtime.flush()?;

    println!("\nReturn value = {}", value);
    Ok(())
}
