use std::path::{Path, PathBuf};
use std::sync::Arc;

use barker::config::{DEFAULT_API_BASE, DEFAULT_PUBLIC_BASE_URL, default_token_file};
use barker::services::auth_store::{AuthStore, AuthUser};
use barker::services::backend_auth::{AuthError, BackendAuth, RegisterRequest};
use barker::services::gateway::{self, ApiRequest, Gateway, GatewayError, LogNavigator, Notifier};
use barker::services::refresh::{RefreshError, TokenRefresher};
use barker::services::tokens::{FileTokenStore, TokenStore};
use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("not signed in; run `barker-cli login` first")]
    NotSignedIn,
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error("could not read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "barker-cli", about = "Barker storefront API client")]
struct Cli {
    #[arg(long, env = "BARKER_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    #[arg(long, env = "PUBLIC_BASE_URL", default_value = DEFAULT_PUBLIC_BASE_URL)]
    public_base_url: String,

    /// Where the token pair is kept between runs.
    #[arg(long, env = "BARKER_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the token pair.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "BARKER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create a client account.
    Register(RegisterArgs),
    /// Exchange the stored refresh token for a new access token.
    Refresh,
    /// Forget the stored tokens.
    Logout,
    /// Show the signed-in user, refreshing an expired token first.
    Whoami,
    /// Send an authenticated request to the API.
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    surname: String,
    #[arg(long)]
    dni: String,
    #[arg(long)]
    phone: String,
    #[arg(long)]
    email: String,
    #[arg(long, env = "BARKER_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Endpoint relative to the API base, e.g. `/store/products/`.
    endpoint: String,

    #[arg(long, short = 'X', default_value = "POST")]
    method: String,

    /// JSON body.
    #[arg(long, conflicts_with_all = ["form", "file"])]
    json: Option<String>,

    /// Multipart text field, `name=value`. Repeatable.
    #[arg(long, value_name = "NAME=VALUE")]
    form: Vec<String>,

    /// Multipart file field, `name=path`. Repeatable.
    #[arg(long, value_name = "NAME=PATH")]
    file: Vec<String>,

    /// Path to navigate to after success.
    #[arg(long)]
    redirect: Option<String>,
}

struct CliContext {
    tokens: Arc<dyn TokenStore>,
    gateway: Gateway,
    refresher: Arc<TokenRefresher>,
    backend: BackendAuth,
    auth: AuthStore,
}

impl CliContext {
    fn new(cli: &Cli) -> Result<Self, CliError> {
        let http = gateway::http_client()?;
        let path = cli.token_file.clone().unwrap_or_else(default_token_file);
        let tokens: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(path));

        let refresher = Arc::new(TokenRefresher::new(http.clone(), &cli.api_base, Arc::clone(&tokens)));
        let backend = BackendAuth::new(http.clone(), &cli.api_base);
        let auth = AuthStore::new(backend.clone(), Arc::clone(&refresher));
        let gateway = Gateway::new(http, &cli.api_base, Arc::clone(&tokens))
            .with_notifier(Arc::new(StderrNotifier))
            .with_navigator(Arc::new(LogNavigator::new(&cli.public_base_url)));

        Ok(Self { tokens, gateway, refresher, backend, auth })
    }
}

/// Prints API success messages for the user.
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn success(&self, message: &str) {
        eprintln!("{message}");
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let ctx = CliContext::new(&cli)?;

    match cli.command {
        Command::Login { username, password } => run_login(&ctx, &username, &password).await,
        Command::Register(args) => run_register(&ctx, args).await,
        Command::Refresh => run_refresh(&ctx).await,
        Command::Logout => {
            ctx.auth.logout();
            println!("signed out");
            Ok(())
        }
        Command::Whoami => run_whoami(&ctx).await,
        Command::Call(args) => run_call(&ctx, args).await,
    }
}

async fn run_login(ctx: &CliContext, username: &str, password: &str) -> Result<(), CliError> {
    ctx.auth.login(username, password).await?;
    // The CLI exits right away; a timer would never fire.
    ctx.refresher.cancel();
    let user = ctx.auth.snapshot().user.ok_or(CliError::NotSignedIn)?;
    print_json(&user_json(&user))
}

async fn run_register(ctx: &CliContext, args: RegisterArgs) -> Result<(), CliError> {
    let request = RegisterRequest::new(&args.name, &args.surname, &args.dni, &args.phone, &args.email, &args.password);
    let response = ctx.backend.register(&request).await?;

    let pair = response.tokens();
    if pair.is_authenticated() {
        ctx.tokens.save(&pair);
    }
    print_json(&json!({
        "registered": request.email,
        "message": response.message,
        "signed_in": pair.is_authenticated(),
    }))
}

async fn run_refresh(ctx: &CliContext) -> Result<(), CliError> {
    let pair = ctx.refresher.refresh_access().await?;
    print_json(&json!({ "refreshed": pair.is_authenticated() }))
}

async fn run_whoami(ctx: &CliContext) -> Result<(), CliError> {
    let signed_in = ctx.auth.rehydrate().await;
    ctx.refresher.cancel();
    if !signed_in {
        return Err(CliError::NotSignedIn);
    }
    let user = ctx.auth.snapshot().user.ok_or(CliError::NotSignedIn)?;
    print_json(&user_json(&user))
}

async fn run_call(ctx: &CliContext, args: CallArgs) -> Result<(), CliError> {
    let method =
        Method::from_bytes(args.method.to_ascii_uppercase().as_bytes()).map_err(|_| CliError::InvalidMethod(args.method.clone()))?;

    let first = ctx.gateway.send(build_request(&args, method.clone()).await?).await;
    let value = match first {
        Err(e) if e.is_auth_failure() && ctx.tokens.load().can_refresh() => {
            tracing::info!("access token rejected; refreshing and retrying once");
            ctx.refresher.refresh_access().await?;
            ctx.gateway.send(build_request(&args, method).await?).await?
        }
        other => other?,
    };
    print_json(&value)
}

/// Build a fresh request; multipart forms cannot be reused across attempts.
async fn build_request(args: &CallArgs, method: Method) -> Result<ApiRequest, CliError> {
    let mut request = ApiRequest::new(args.endpoint.clone()).method(method);

    if let Some(raw) = &args.json {
        request = request.json(serde_json::from_str::<Value>(raw)?);
    } else if !args.form.is_empty() || !args.file.is_empty() {
        let mut form = Form::new();
        for field in &args.form {
            let (name, value) = split_field(field)?;
            form = form.text(name.to_owned(), value.to_owned());
        }
        for field in &args.file {
            let (name, path) = split_field(field)?;
            form = form.part(name.to_owned(), file_part(Path::new(path)).await?);
        }
        request = request.multipart(form);
    }

    if let Some(path) = &args.redirect {
        request = request.redirect_to(path.clone());
    }
    Ok(request)
}

async fn file_part(path: &Path) -> Result<Part, CliError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CliError::ReadFile { path: path.to_owned(), source })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_owned());
    Ok(Part::bytes(bytes).file_name(name))
}

fn split_field(raw: &str) -> Result<(&str, &str), CliError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => Err(CliError::InvalidArg(format!("expected NAME=VALUE, got `{raw}`"))),
    }
}

fn user_json(user: &AuthUser) -> Value {
    json!({
        "id": user.id,
        "username": user.username,
        "name": user.name,
        "roles": user.roles,
    })
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
