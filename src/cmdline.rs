use structopt::StructOpt;
use std::path::PathBuf;

#[derive(Debug, StructOpt)]
#[structopt(name = "silica", about = "Compile and run a Silica program")]
pub struct RunCmd {
    /// Source file to compile.
    pub in_file: PathBuf,
    /// Function to call once compiled.
    #[structopt(long, default_value = "main")]
    pub entry: String,
    /// Print the syntax tree as JSON before running.
    #[structopt(long)]
    pub emit_ast: bool,
    /// Print the generated sections as hex before running.
    #[structopt(long)]
    pub emit_code: bool,
}
