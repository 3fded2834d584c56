//! Auth command handlers: device-code login and logout.

use anyhow::{Context, Result};
use onedrive_core::auth::DeviceCodeFlow;
use tracing::info;

use crate::app::context::{AppContext, persist_token};
use crate::app::exit::ProcessExit;
use crate::app_config;
use crate::cli::LoginArgs;

pub(crate) async fn run_login(ctx: &AppContext, args: &LoginArgs) -> Result<ProcessExit> {
    let oauth = ctx.oauth_client(args.client_id.as_deref(), args.tenant.as_deref())?;
    let flow = DeviceCodeFlow::new(oauth);

    let authorization = flow.start().await.context("Could not start device login")?;
    match &authorization.message {
        Some(message) => eprintln!("{message}"),
        None => eprintln!(
            "To sign in, open {} and enter the code {}",
            authorization.verification_uri, authorization.user_code
        ),
    }

    let token = flow
        .wait_for_token(&authorization)
        .await
        .context("Login did not complete")?;

    let mut config = app_config::load_config(&ctx.config_path)?;
    if let Some(client_id) = &args.client_id {
        config.client_id = Some(client_id.clone());
    }
    if let Some(tenant) = &args.tenant {
        config.tenant = Some(tenant.clone());
    }
    config.token = Some(token);
    app_config::save_config(&ctx.config_path, &config)?;

    info!(path = %ctx.config_path.display(), "Signed in");
    Ok(ProcessExit::Success)
}

pub(crate) fn run_logout(ctx: &AppContext) -> Result<ProcessExit> {
    if ctx.config.token.is_none() {
        info!("Not signed in");
        return Ok(ProcessExit::Success);
    }
    persist_token(&ctx.config_path, None)?;
    info!("Signed out; stored token removed");
    Ok(ProcessExit::Success)
}
