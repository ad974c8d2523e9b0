use anyhow::Context;

use fortsyncd::daemon::{self, DaemonConfig, DaemonRuntime};
use fortsyncd::token_store::TokenStore;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run { json: bool },
    ListFolders,
    SaveToken(String),
    ForgetToken,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut json = false;
    let mut mode = None;
    let mut iter = args.into_iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--list-folders" => mode = Some(CliMode::ListFolders),
            "--save-token" => {
                let token = iter.next().context("--save-token requires a value")?;
                mode = Some(CliMode::SaveToken(token));
            }
            "--forget-token" => mode = Some(CliMode::ForgetToken),
            "--help" | "-h" => mode = Some(CliMode::Help),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode.unwrap_or(CliMode::Run { json }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: fortsyncd [--json | --list-folders | --save-token <token> | --forget-token]");
            println!("  --json                 Emit events as JSON lines on stdout");
            println!("  --list-folders         Print the account's root folders and exit");
            println!("  --save-token <token>   Store the API token and exit");
            println!("  --forget-token         Remove the stored API token and exit");
        }
        CliMode::SaveToken(token) => {
            TokenStore::new()?.save(&token)?;
            eprintln!("[fortsyncd] token saved");
        }
        CliMode::ForgetToken => {
            TokenStore::new()?.forget()?;
            eprintln!("[fortsyncd] saved token removed");
        }
        CliMode::ListFolders => {
            let base_url = std::env::var("FORTSYNC_BASE_URL").ok();
            daemon::list_root_folders(base_url.as_deref()).await?;
        }
        CliMode::Run { json } => {
            let mut config = DaemonConfig::from_env()?;
            config.json_output = json;
            let runtime = DaemonRuntime::bootstrap(config)?;
            let clean = runtime.run().await?;
            if !clean {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
