//! SQLite-backed bid store and the per-listing merge.

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use mps_core::{Money, OrganizationName, ParsedListing, Person};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// The bid was already stored; only reference data was touched.
    AlreadyStored,
}

#[derive(Debug, Clone)]
pub struct BidStore {
    pool: SqlitePool,
}

impl BidStore {
    /// Opens the database, creating the file when missing. The pool holds a
    /// single connection so `sqlite::memory:` stays one database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running store migrations")?;
        debug!("store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn contains_bid(&self, idn: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM bid WHERE idn = ?")
            .bind(idn)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up bid {idn}"))?;
        Ok(found.is_some())
    }

    pub async fn stored_bid_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT idn FROM bid")
            .fetch_all(&self.pool)
            .await
            .context("listing stored bids")?;
        Ok(ids.into_iter().collect())
    }

    /// Reconciles one listing graph inside a single transaction. Reference
    /// data is always upserted; the bid and everything hanging off it is only
    /// written when the identifier is new.
    pub async fn merge(&self, listing: &ParsedListing) -> Result<MergeOutcome> {
        let idn = listing.bid.idn.as_str();
        let mut tx = self.pool.begin().await.context("starting merge transaction")?;

        upsert_reference_data(&mut tx, listing).await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM bid WHERE idn = ?")
            .bind(idn)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            tx.commit().await.context("committing reference data")?;
            debug!(idn, "bid already stored; left untouched");
            return Ok(MergeOutcome::AlreadyStored);
        }

        insert_bid_graph(&mut tx, listing)
            .await
            .with_context(|| format!("inserting bid {idn}"))?;
        tx.commit()
            .await
            .with_context(|| format!("committing bid {idn}"))?;
        info!(
            idn,
            products = listing.bid.products.len(),
            applications = listing.bid.applications.len(),
            "bid merged"
        );
        Ok(MergeOutcome::Inserted)
    }
}

async fn upsert_reference_data(tx: &mut Transaction<'_, Sqlite>, listing: &ParsedListing) -> Result<()> {
    for currency in listing.currencies() {
        sqlx::query("INSERT INTO currency (code) VALUES (?) ON CONFLICT (code) DO NOTHING")
            .bind(currency.as_str())
            .execute(&mut **tx)
            .await
            .with_context(|| format!("upserting currency {}", currency.as_str()))?;
    }
    for product_type in listing.product_types.values() {
        sqlx::query(
            r#"
            INSERT INTO product_type (code, name) VALUES (?, ?)
            ON CONFLICT (code) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(product_type.code)
        .bind(&product_type.name)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("upserting product type {}", product_type.code))?;
    }
    for organization in &listing.organizations {
        sqlx::query("INSERT INTO organization (rut) VALUES (?) ON CONFLICT (rut) DO NOTHING")
            .bind(organization.rut.to_string())
            .execute(&mut **tx)
            .await
            .with_context(|| format!("upserting organization {}", organization.rut))?;
    }
    for name in &listing.organization_names {
        sqlx::query(
            r#"
            INSERT INTO organization_name (organization_rut, name) VALUES (?, ?)
            ON CONFLICT (organization_rut, name) DO NOTHING
            "#,
        )
        .bind(name.organization_rut.to_string())
        .bind(&name.name)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("upserting name of {}", name.organization_rut))?;
    }
    Ok(())
}

async fn organization_name_id(tx: &mut Transaction<'_, Sqlite>, name: &OrganizationName) -> Result<i64> {
    sqlx::query_scalar("SELECT id FROM organization_name WHERE organization_rut = ? AND name = ?")
        .bind(name.organization_rut.to_string())
        .bind(&name.name)
        .fetch_one(&mut **tx)
        .await
        .with_context(|| format!("resolving name {:?} of {}", name.name, name.organization_rut))
}

async fn insert_person(tx: &mut Transaction<'_, Sqlite>, person: &Person) -> Result<i64> {
    let person_id = sqlx::query("INSERT INTO person (rut, names, surnames) VALUES (?, ?, ?)")
        .bind(person.rut.as_ref().map(ToString::to_string))
        .bind(&person.names)
        .bind(&person.surnames)
        .execute(&mut **tx)
        .await
        .context("inserting contact")?
        .last_insert_rowid();
    for email in &person.email_addresses {
        sqlx::query("INSERT OR IGNORE INTO person_email_address (person_id, email) VALUES (?, ?)")
            .bind(person_id)
            .bind(email)
            .execute(&mut **tx)
            .await?;
    }
    for phone in &person.phone_numbers {
        sqlx::query("INSERT OR IGNORE INTO person_phone_number (person_id, phone_number) VALUES (?, ?)")
            .bind(person_id)
            .bind(phone)
            .execute(&mut **tx)
            .await?;
    }
    Ok(person_id)
}

fn money_columns(money: &Money) -> (String, String) {
    (money.amount().to_string(), money.currency().as_str().to_string())
}

async fn insert_bid_graph(tx: &mut Transaction<'_, Sqlite>, listing: &ParsedListing) -> Result<()> {
    let bid = &listing.bid;
    let issuer_name_id = organization_name_id(tx, &bid.organization).await?;
    let contact_id = match &bid.contact {
        Some(person) => Some(insert_person(tx, person).await?),
        None => None,
    };
    let (sum_amount, sum_currency) = money_columns(&bid.sum);

    sqlx::query(
        r#"
        INSERT INTO bid (
            idn, kind, title, summary, status, published_at, closed_at,
            time_limit_amount, time_limit_unit, sum_amount, sum_currency,
            organization_name_id, contact_id, stored_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&bid.idn)
    .bind(bid.kind.code())
    .bind(&bid.title)
    .bind(&bid.summary)
    .bind(bid.status.code())
    .bind(bid.published_at)
    .bind(bid.closed_at)
    .bind(bid.time_limit.map(|t| i64::from(t.amount)))
    .bind(bid.time_limit.map(|t| t.unit.as_str()))
    .bind(sum_amount)
    .bind(sum_currency)
    .bind(issuer_name_id)
    .bind(contact_id)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .context("inserting bid row")?;

    let mut product_ids = Vec::with_capacity(bid.products.len());
    for (position, product) in bid.products.iter().enumerate() {
        let id = sqlx::query(
            r#"
            INSERT INTO product (bid_idn, position, title, quantity, product_type_code)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bid.idn)
        .bind(position as i64)
        .bind(&product.title)
        .bind(product.quantity)
        .bind(product.type_code)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting product #{position}"))?
        .last_insert_rowid();
        product_ids.push(id);
    }

    let mut application_ids = Vec::with_capacity(bid.applications.len());
    for (index, application) in bid.applications.iter().enumerate() {
        let name_id = organization_name_id(tx, &application.organization).await?;
        let (total_amount, total_currency) = money_columns(&application.total_sum);
        let application_id = sqlx::query(
            r#"
            INSERT INTO application (
                bid_idn, organization_name_id, total_amount, total_currency, accepted, sent_at, summary
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bid.idn)
        .bind(name_id)
        .bind(total_amount)
        .bind(total_currency)
        .bind(application.accepted)
        .bind(application.sent_at)
        .bind(&application.summary)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting application #{index}"))?
        .last_insert_rowid();

        for quoted in &application.products {
            let product_id = product_ids.get(quoted.product_index).copied().ok_or_else(|| {
                anyhow!(
                    "application #{index} quotes product #{} which is not part of bid {}",
                    quoted.product_index,
                    bid.idn
                )
            })?;
            let (amount, currency) = money_columns(&quoted.sum);
            sqlx::query(
                r#"
                INSERT INTO application_product (application_id, product_id, sum_amount, sum_currency)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(application_id)
            .bind(product_id)
            .bind(amount)
            .bind(currency)
            .execute(&mut **tx)
            .await?;
        }
        application_ids.push(application_id);
    }

    if let Some(order) = &bid.buying_order {
        let application_id = order
            .application_index
            .and_then(|index| application_ids.get(index).copied());
        sqlx::query(
            r#"
            INSERT INTO buying_order (idn, bid_idn, published_at, notes, application_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.idn)
        .bind(&bid.idn)
        .bind(order.published_at)
        .bind(&order.notes)
        .bind(application_id)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting buying order {}", order.idn))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use mps_core::{
        parse_money, Application, ApplicationProduct, Bid, BidKind, BidStatus, BuyingOrder, Organization,
        Product, ProductType, Rut,
    };

    async fn store() -> BidStore {
        let store = BidStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    async fn count(store: &BidStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    fn rut(text: &str) -> Rut {
        text.parse().unwrap()
    }

    fn listing(idn: &str) -> ParsedListing {
        let issuer = OrganizationName {
            organization_rut: rut("61.979.440-0"),
            name: "Servicio de Salud Ejemplo".into(),
        };
        let provider = OrganizationName {
            organization_rut: rut("76.543.210-3"),
            name: "Papeles SpA".into(),
        };
        let when = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        ParsedListing {
            bid: Bid {
                idn: idn.into(),
                kind: BidKind::Agile,
                title: "Resmas".into(),
                summary: None,
                status: BidStatus::BuyingOrderEmitted,
                published_at: when.and_hms_opt(9, 0, 0).unwrap(),
                closed_at: when.and_hms_opt(18, 0, 0).unwrap(),
                time_limit: None,
                sum: parse_money("$", "120.000").unwrap(),
                organization: issuer.clone(),
                products: vec![Product {
                    title: "Resma carta".into(),
                    quantity: Some(10),
                    type_code: 14111507,
                }],
                contact: Some(Person {
                    rut: None,
                    names: "Juan".into(),
                    surnames: Some("Rojas".into()),
                    phone_numbers: vec!["+56223456789".into()],
                    email_addresses: vec!["jrojas@example.cl".into()],
                }),
                buying_order: Some(BuyingOrder {
                    idn: format!("{idn}-OC"),
                    published_at: None,
                    notes: None,
                    application_index: Some(0),
                }),
                applications: vec![Application {
                    organization: provider.clone(),
                    products: vec![ApplicationProduct {
                        product_index: 0,
                        sum: parse_money("$", "4.000").unwrap(),
                    }],
                    total_sum: parse_money("$", "40.000").unwrap(),
                    accepted: Some(true),
                    sent_at: when,
                    summary: Some("Entrega inmediata".into()),
                }],
            },
            product_types: BTreeMap::from([(
                14111507,
                ProductType {
                    code: 14111507,
                    name: "Papel".into(),
                },
            )]),
            organizations: vec![
                Organization {
                    rut: issuer.organization_rut.clone(),
                },
                Organization {
                    rut: provider.organization_rut.clone(),
                },
            ],
            organization_names: vec![issuer, provider],
        }
    }

    #[tokio::test]
    async fn merging_twice_is_idempotent() {
        let store = store().await;
        let listing = listing("2241-15-COT24");

        assert_eq!(store.merge(&listing).await.unwrap(), MergeOutcome::Inserted);
        assert_eq!(store.merge(&listing).await.unwrap(), MergeOutcome::AlreadyStored);

        assert_eq!(count(&store, "bid").await, 1);
        assert_eq!(count(&store, "product").await, 1);
        assert_eq!(count(&store, "application").await, 1);
        assert_eq!(count(&store, "application_product").await, 1);
        assert_eq!(count(&store, "buying_order").await, 1);
        assert_eq!(count(&store, "person").await, 1);
        assert_eq!(count(&store, "product_type").await, 1);
        assert_eq!(count(&store, "organization").await, 2);
        assert_eq!(count(&store, "organization_name").await, 2);
        assert_eq!(count(&store, "currency").await, 5);
        assert!(store.contains_bid("2241-15-COT24").await.unwrap());
    }

    #[tokio::test]
    async fn shared_reference_data_is_not_duplicated() {
        let store = store().await;
        let mut second = listing("9-9-COT24");
        second.product_types.get_mut(&14111507).unwrap().name = "Papel de imprenta".into();
        second.bid.sum = parse_money("USD", "15").unwrap();

        store.merge(&listing("2241-15-COT24")).await.unwrap();
        store.merge(&second).await.unwrap();

        assert_eq!(count(&store, "bid").await, 2);
        assert_eq!(count(&store, "organization").await, 2);
        assert_eq!(count(&store, "product_type").await, 1);
        let name: String = sqlx::query_scalar("SELECT name FROM product_type WHERE code = 14111507")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(name, "Papel de imprenta");
        assert_eq!(count(&store, "currency").await, 5);

        let ids = store.stored_bid_ids().await.unwrap();
        assert!(ids.contains("9-9-COT24") && ids.contains("2241-15-COT24"));
    }

    #[tokio::test]
    async fn failed_merge_leaves_nothing_behind() {
        let store = store().await;
        let mut broken = listing("3-3-COT24");
        broken.bid.applications[0].products[0].product_index = 7;

        assert!(store.merge(&broken).await.is_err());
        assert_eq!(count(&store, "bid").await, 0);
        assert_eq!(count(&store, "person").await, 0);
        assert_eq!(count(&store, "organization").await, 0);

        store.merge(&listing("4-4-COT24")).await.unwrap();
        assert_eq!(count(&store, "bid").await, 1);
    }

    #[tokio::test]
    async fn money_is_stored_exactly() {
        let store = store().await;
        store.merge(&listing("2241-15-COT24")).await.unwrap();
        let (amount, currency): (String, String) =
            sqlx::query_as("SELECT sum_amount, sum_currency FROM bid WHERE idn = ?")
                .bind("2241-15-COT24")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(amount, "120000");
        assert_eq!(currency, "clp");
    }
}
