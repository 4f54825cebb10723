use argh::FromArgs;

mod cmd_compile;
mod cmd_recognize;

#[derive(FromArgs)]
/// Compile spoken-command grammars and recognize utterances against them
struct Args {
    /// print DEBUG messages to the console
    #[argh(switch)]
    debug: bool,

    #[argh(subcommand)]
    subcommand: Subcommand,
}

#[derive(FromArgs)]
/// do something
#[argh(subcommand)]
enum Subcommand {
    Compile(cmd_compile::Compile),
    Recognize(cmd_recognize::Recognize),
}

impl Subcommand {
    fn run(self) -> Result<(), String> {
        match self {
            Subcommand::Compile(cmd) => cmd.run(),
            Subcommand::Recognize(cmd) => cmd.run(),
        }
    }
}

fn main() {
    let args = argh::from_env::<Args>();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(message) = args.subcommand.run() {
        eprintln!("{message}");
        std::process::exit(1);
    }
}
