//! Interactive phone / code / 2FA login for the user session.

use async_trait::async_trait;
use grammers_client::SignInError;

use chanwatch_core::{errors::Error, Result};

use crate::UserGateway;

/// Supplies what Telegram asks for during login.
#[async_trait]
pub trait LoginPrompt: Send {
    /// The code Telegram sent to the account's other sessions or by SMS.
    async fn code(&mut self) -> Result<String>;
    /// Two-step verification password.
    async fn password(&mut self, hint: Option<String>) -> Result<String>;
}

impl UserGateway {
    /// Log the session in and persist it. A session that is already
    /// authorized is left alone.
    pub async fn login(&self, phone: &str, prompt: &mut dyn LoginPrompt) -> Result<()> {
        let authorized = self
            .client
            .is_authorized()
            .await
            .map_err(|e| crate::rpc::map_invocation(e, None))?;
        if authorized {
            tracing::info!("session already authorized");
            return Ok(());
        }

        let token = self
            .client
            .request_login_code(phone)
            .await
            .map_err(|e| Error::Auth(format!("login code request failed: {e}")))?;
        tracing::info!("login code requested");

        let code = prompt.code().await?;
        match self.client.sign_in(&token, code.trim()).await {
            Ok(_) => {}
            Err(SignInError::PasswordRequired(password_token)) => {
                let hint = password_token.hint().map(|h| h.to_string());
                let password = prompt.password(hint).await?;
                self.client
                    .check_password(password_token, password.trim())
                    .await
                    .map_err(|e| Error::Auth(format!("password rejected: {e}")))?;
            }
            Err(e) => return Err(Error::Auth(format!("sign in failed: {e}"))),
        }

        self.save_session()?;
        tracing::info!(session = %self.session_path.display(), "logged in");
        Ok(())
    }
}
