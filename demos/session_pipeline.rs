//! Session Pipeline Example
//!
//! Activates the session schema, records a subject with two sessions and
//! their attributes, queries them, exports to Parquet and shows a blocked
//! and a cascading delete.
//!
//! Run with: RUST_LOG=element_session=debug cargo run --example session_pipeline

use anyhow::Context;
use element_session::query::Restriction;
use element_session::schema::Row;
use element_session::session::SessionRecord;
use element_session::store::RecordStore;
use element_session::{Config, Database, Error};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== element-session pipeline ===\n");

    let config = Config::default().with_env_overrides()?;
    let db = Database::builder().config(config).build()?;
    let schema = db.session().context("activating the session schema")?;
    let store = db.store();
    println!("1. Activated schemas: {:?}", db.registry().namespaces());

    // -------------------------------------------------------------------------
    // 2. Upstream records
    // -------------------------------------------------------------------------
    let lab = db
        .registry()
        .schema(&format!("{}lab", db.config().database_prefix))
        .context("lab schema")?;
    let subject_schema = db
        .registry()
        .schema(&format!("{}subject", db.config().database_prefix))
        .context("subject schema")?;
    let user = lab.get("User")?;
    let subject = subject_schema.get("Subject")?;

    store
        .insert(&user, Row::new().with("user", "alice").with("user_fullname", "Alice A."))
        .await?;
    store
        .insert(
            &subject,
            Row::new()
                .with("subject", "M01")
                .with("sex", "F")
                .with("subject_birth_date", "2024-01-15"),
        )
        .await?;
    println!("2. Inserted user `alice` and subject `M01`");

    // -------------------------------------------------------------------------
    // 3. Sessions, attributes, experimenters
    // -------------------------------------------------------------------------
    let sessions = [
        SessionRecord::builder("M01", "S1").session_type("ephys").build(),
        SessionRecord::builder("M01", "S2").session_type("behavior").build(),
    ];
    for record in &sessions {
        store.insert(schema.session(), record.to_row()).await?;
        store
            .insert(
                schema.session_attribute(),
                record
                    .key()
                    .with("attribute_name", "probe")
                    .with("attribute_value", "neuropixels-2.0"),
            )
            .await?;
        store
            .insert(schema.session_experimenter(), record.key().with("user", "alice"))
            .await?;
    }
    store
        .insert(
            schema.session_directory(),
            sessions[0].key().with("session_dir", "/data/M01/S1"),
        )
        .await?;
    println!("3. Inserted {} sessions", store.len(schema.session())?);

    // -------------------------------------------------------------------------
    // 4. Restrictions
    // -------------------------------------------------------------------------
    let ephys = store
        .fetch(schema.session(), Restriction::condition("session_type = 'ephys'"))
        .await?;
    for row in &ephys {
        let record = SessionRecord::from_row(&row)?;
        println!("4. ephys session: {} / {}", record.subject(), record.session_id());
    }

    // -------------------------------------------------------------------------
    // 5. Columnar export
    // -------------------------------------------------------------------------
    let dir = std::env::temp_dir().join("element_session_demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("session.parquet");
    let written = store.export_parquet(schema.session(), &path)?;
    println!("5. Exported {written} sessions to {}", path.display());

    // -------------------------------------------------------------------------
    // 6. Deletes
    // -------------------------------------------------------------------------
    let s1 = sessions[0].key();
    match store.delete(schema.session(), &s1).await {
        Err(Error::CascadeBlocked { dependent, dependents, .. }) => {
            println!("6. Delete blocked by {dependents} row(s) of `{dependent}`");
        }
        other => anyhow::bail!("expected a blocked delete, got {other:?}"),
    }

    for entity in [
        schema.session_experimenter(),
        schema.session_directory(),
    ] {
        let keys = store.fetch(entity, Restriction::key(s1.clone())).await?.to_vec();
        for key in keys {
            store.delete(entity, &key).await?;
        }
    }
    let summary = store.delete(schema.session(), &s1).await?;
    println!("   Deleted after clearing dependents:");
    for (entity, count) in summary.iter() {
        println!("     {entity}: {count}");
    }

    println!("\n=== done ===");
    Ok(())
}
