use std::path::{Path, PathBuf};

use lounge_billing::adapters::db::{open_connection, run_migrations, schema_version};

const USAGE: &str = "\
create_test_db

Prepares the migrated SQLite template the test suite copies from.

Usage:
  cargo run --bin create_test_db -- [--path <file>] [--force]

Options:
  --path <file>   target sqlite file (default: data/lounge_test.db)
  --force         delete existing file before creating";

struct Options {
    path: PathBuf,
    force: bool,
}

fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => {
            println!("{USAGE}");
            return;
        }
        Err(error) => {
            eprintln!("{error}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(error) = create(&options) {
        eprintln!("failed to create test db: {error}");
        std::process::exit(1);
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Options>, String> {
    let mut options = Options {
        path: Path::new("data").join("lounge_test.db"),
        force: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--path" => {
                let value = args.next().ok_or("--path requires a value")?;
                options.path = PathBuf::from(value);
            }
            "--force" => options.force = true,
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Some(options))
}

fn create(options: &Options) -> Result<(), String> {
    if let Some(parent) = options.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    if options.force && options.path.exists() {
        std::fs::remove_file(&options.path)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let path = options.path.to_string_lossy();
    let mut connection = open_connection(&path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;
    let version = schema_version(&connection).map_err(|error| error.to_string())?;

    println!("created/updated test db at: {path}");
    println!("schema version: {version}");
    Ok(())
}
