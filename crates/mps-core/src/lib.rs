//! Core domain model for agile-bid acquisition: the parsed Bid graph, the raw
//! artifact bundle handed from the navigator to the parser, and the value
//! types (`Rut`, `Money`) that only exist in validated form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub mod money;
pub mod validators;

pub use money::{parse_money, CurrencyCode, Money, MoneyError, LOCAL_CURRENCY};
pub use validators::{Lenient, Rut, ValidationError, ValidationKind};

pub const CRATE_NAME: &str = "mps-core";

/// A downloaded or captured file, kept in memory with the name the portal suggested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFile<T> {
    pub filename: String,
    pub content: T,
}

impl<T> VirtualFile<T> {
    pub fn new(filename: impl Into<String>, content: T) -> Self {
        Self {
            filename: filename.into(),
            content,
        }
    }
}

/// Unparsed output of crawling one listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawArtifactBundle {
    pub idn: String,
    /// Main detail document (HTML).
    pub main_html: String,
    /// Provider-detail modal payloads (JSON envelopes), in provider-grid order.
    pub modals: Vec<String>,
    /// Modal payload of the selected provider, if a selection exists.
    pub selected_modal: Option<String>,
    /// Provider listing export (an HTML table served as `.xls`).
    pub provider_listing: Option<VirtualFile<String>>,
    /// Buying-order page snapshot (HTML).
    pub buying_order_html: Option<String>,
    pub buying_order_pdf: Option<VirtualFile<Vec<u8>>>,
}

impl RawArtifactBundle {
    pub fn new(idn: impl Into<String>, main_html: impl Into<String>) -> Self {
        Self {
            idn: idn.into(),
            main_html: main_html.into(),
            modals: Vec::new(),
            selected_modal: None,
            provider_listing: None,
            buying_order_html: None,
            buying_order_pdf: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BidStatus {
    Published,
    Closed,
    BuyingOrderEmitted,
    Cancelled,
}

impl BidStatus {
    /// Maps the status label shown by the portal. Anything outside the closed
    /// set yields `None`.
    pub fn from_portal_label(label: &str) -> Option<Self> {
        match label.trim() {
            "Publicada" => Some(Self::Published),
            "Cerrada" => Some(Self::Closed),
            "OC Emitida" => Some(Self::BuyingOrderEmitted),
            "Cancelada" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Stable integer code used by the store.
    pub fn code(self) -> i64 {
        match self {
            Self::Published => 1,
            Self::Closed => 2,
            Self::BuyingOrderEmitted => 3,
            Self::Cancelled => 4,
        }
    }

    /// Value of the portal's status drop-down when searching.
    pub fn search_filter_value(self) -> &'static str {
        match self {
            Self::Published => "2",
            Self::Closed => "3",
            Self::BuyingOrderEmitted => "4",
            Self::Cancelled => "5",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidKind {
    Regular,
    Agile,
}

impl BidKind {
    pub fn code(self) -> i64 {
        match self {
            Self::Regular => 1,
            Self::Agile => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Hours,
    Days,
    BusinessDays,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hours => "hours",
            Self::Days => "days",
            Self::BusinessDays => "business_days",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimit {
    pub amount: u32,
    pub unit: TimeUnit,
}

impl fmt::Display for TimeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::BusinessDays => "business days",
        };
        write!(f, "{} {}", self.amount, unit)
    }
}

/// Shared code → name lookup, deduplicated by code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductType {
    pub code: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub title: String,
    pub quantity: Option<i64>,
    pub type_code: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Organization {
    pub rut: Rut,
}

/// One recorded display name of an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrganizationName {
    pub organization_rut: Rut,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub rut: Option<Rut>,
    pub names: String,
    pub surnames: Option<String>,
    /// E.164 numbers.
    pub phone_numbers: Vec<String>,
    pub email_addresses: Vec<String>,
}

/// A quote for one line of the bid. `product_index` points into `Bid::products`,
/// so a quoted product always belongs to the same bid as its application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationProduct {
    pub product_index: usize,
    pub sum: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub organization: OrganizationName,
    pub products: Vec<ApplicationProduct>,
    pub total_sum: Money,
    /// `None` until the buyer has selected a provider.
    pub accepted: Option<bool>,
    pub sent_at: NaiveDate,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyingOrder {
    pub idn: String,
    pub published_at: Option<NaiveDateTime>,
    pub notes: Option<String>,
    /// Index of the winning application in `Bid::applications`.
    pub application_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub idn: String,
    pub kind: BidKind,
    pub title: String,
    pub summary: Option<String>,
    pub status: BidStatus,
    pub published_at: NaiveDateTime,
    pub closed_at: NaiveDateTime,
    pub time_limit: Option<TimeLimit>,
    pub sum: Money,
    pub organization: OrganizationName,
    pub products: Vec<Product>,
    pub contact: Option<Person>,
    pub buying_order: Option<BuyingOrder>,
    pub applications: Vec<Application>,
}

/// Everything parsed out of one listing, ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedListing {
    pub bid: Bid,
    pub product_types: BTreeMap<i64, ProductType>,
    pub organizations: Vec<Organization>,
    pub organization_names: Vec<OrganizationName>,
}

impl ParsedListing {
    /// Every currency referenced anywhere in the graph.
    pub fn currencies(&self) -> BTreeSet<CurrencyCode> {
        let mut out = BTreeSet::new();
        out.insert(self.bid.sum.currency().clone());
        for application in &self.bid.applications {
            out.insert(application.total_sum.currency().clone());
            for product in &application.products {
                out.insert(product.sum.currency().clone());
            }
        }
        out
    }
}
