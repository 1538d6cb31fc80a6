use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::{CurrentUser, UserRole};
use crate::services::AuthService;
use crate::AppState;

/// Authentication middleware
///
/// Extracts and validates the bearer JWT, then cross-checks the user row:
/// deactivated accounts and tokens issued before the last password rotation
/// are both rejected.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            return Err(AppError::AuthFailure(
                "Missing or invalid Authorization header".to_string(),
            ));
        }
    };

    let claims = AuthService::validate_token(token, &state.config)?;

    let user = AuthService::get_user(&state.db, &claims.id)
        .await
        .map_err(|_| AppError::AuthFailure("Invalid token".to_string()))?;

    if !user.is_active {
        return Err(AppError::Forbidden("Account is disabled".to_string()));
    }

    if AuthService::token_issued_before_rotation(claims.iat, user.password_changed_at.as_deref()) {
        return Err(AppError::AuthFailure(
            "Password was changed recently. Please log in again.".to_string(),
        ));
    }

    let current_user = CurrentUser {
        id: user.id,
        username: user.username,
        role: UserRole::from_str(&user.role),
    };
    tracing::debug!(
        "Authenticated {} ({})",
        current_user.username,
        current_user.role.as_str()
    );
    request.extensions_mut().insert(current_user);

    Ok(next.run(request).await)
}
