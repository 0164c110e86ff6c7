use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::{Connection, PgConnection};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn() -> Result<DbPool, diesel::r2d2::PoolError> {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://meetserver:@localhost:5432/meetserver".to_string());
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager)
}

pub fn establish_pg_connection() -> Result<PgConnection> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    PgConnection::establish(&database_url)
        .with_context(|| format!("Failed to connect to database at {}", database_url))
}

/// Public object ids: a short type prefix plus 16 random alphanumerics,
/// e.g. `bot_h4X9m2QpL7sWv0Ra`.
pub fn generate_object_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, suffix)
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Run a blocking diesel closure on the blocking pool with a connection
/// checked out from `pool`.
pub async fn with_conn<F, T>(pool: DbPool, f: F) -> Result<T>
where
    F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().context("Failed to get connection from pool")?;
        f(&mut conn)
    })
    .await
    .context("Blocking database task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ids_carry_prefix_and_length() {
        let id = generate_object_id("bot");
        assert!(id.starts_with("bot_"));
        assert_eq!(id.len(), "bot_".len() + 16);
        assert_ne!(generate_object_id("bot"), generate_object_id("bot"));
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
