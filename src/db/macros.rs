//! Backend dispatch macro.
//!
//! Both [`DbPool`](crate::db::pool::DbPool) and
//! [`PooledConnection`](crate::db::pool::PooledConnection) carry one variant
//! per backend with identical names, so a single macro generates the match
//! for either of them.

/// Generate one match arm per backend variant.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, &self.pool, {
///     MySql(p) => p.close().await,
///     Postgres(p) => p.close().await,
///     SQLite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($enum:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::pool::$enum::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
