//! Turns a [`RawArtifactBundle`] into a linked [`ParsedListing`].
//!
//! The detail page is read by element id, the provider export (an HTML table
//! served as `.xls`) is grouped into per-provider chunks and paired
//! positionally with the captured modal payloads.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use mps_core::validators::{
    normalize_full_name, validate_cl_phone_number, validate_email_address, validate_pro_code,
    validate_rut,
};
use mps_core::{
    parse_money, Application, ApplicationProduct, Bid, BidKind, BidStatus, BuyingOrder, Lenient,
    MoneyError, Organization, OrganizationName, ParsedListing, Person, Product, ProductType,
    RawArtifactBundle, Rut, TimeLimit, TimeUnit, ValidationError,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DATETIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";
pub const DATE_FORMAT: &str = "%d-%m-%Y";

static TIME_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(\d+)\s*(d[ií]as?|horas?)(\s+h[aá]bil(?:es)?)?").expect("static regex")
});

const PROVIDER_COLUMNS: &[(&str, &str)] = &[
    ("Cotizacion", "i"),
    ("Orden", "j"),
    ("Rut Proveedor", "organization_rut"),
    ("Razon Social", "organization_name"),
    ("Nombre Producto", "product_name"),
    ("Detalle Producto", "product_summary"),
    ("Cantidad", "amount"),
    ("Moneda", "sum_currency"),
    ("Precio Unitario", "sum_per_unit"),
    ("Total Impuestos", "sum_taxed"),
    ("Monto Total Cotizacion", "sum_total"),
    ("Codigo Solicitud Cotizacion", "bid_idn"),
];

const SEARCH_COLUMNS: &[(&str, &str)] = &[
    ("ID", "idn"),
    ("Nombre", "name"),
    ("Unidad de compra", "buying_unit"),
    ("Fecha de publicación", "published_at"),
    ("Fecha de cierre", "closed_at"),
    ("Estado", "status"),
    ("Cotizaciones enviadas", "sent_applications"),
    ("Institución", "organization_name"),
];

const SEARCH_DATE_FORMATS: &[&str] = &[
    DATETIME_FORMAT,
    "%d-%m-%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("detail page is for {found}, not {expected}")]
    IdentifierMismatch { expected: String, found: String },
    #[error("unknown bid status {0:?}")]
    UnknownStatus(String),
    #[error("provider listing has {groups} groups but {modals} modal payloads were captured")]
    GroupCountMismatch { groups: usize, modals: usize },
    #[error("malformed modal payload #{index}: {reason}")]
    MalformedModal { index: usize, reason: String },
    #[error("bad timestamp in {field}: {value:?}")]
    BadTimestamp { field: &'static str, value: String },
    #[error("unexpected table shape: {0}")]
    TableShape(String),
    #[error("invalid selector {0:?}")]
    Selector(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// One row of the search results export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub idn: String,
    pub name: Option<String>,
    pub buying_unit: Option<String>,
    pub published_at: Option<NaiveDateTime>,
    pub closed_at: Option<NaiveDateTime>,
    pub status: Option<BidStatus>,
    pub sent_applications: Option<u32>,
    pub organization_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModalEnvelope {
    d: String,
}

#[derive(Debug, Deserialize)]
struct ModalPayload {
    #[serde(rename = "FechaEnvio")]
    sent_at: String,
    #[serde(rename = "Descripcion")]
    description: Option<String>,
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(format!("{css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

fn select_child_text(element: ElementRef<'_>, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(element.select(&sel).next().and_then(element_text))
}

fn text_by_id(document: &Html, id: &str) -> Result<Option<String>, ParseError> {
    select_first_text(document, &format!("#{id}"))
}

fn required_by_id(document: &Html, id: &str, field: &'static str) -> Result<String, ParseError> {
    text_by_id(document, id)?.ok_or(ParseError::MissingField(field))
}

fn parse_datetime(field: &'static str, value: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(value.trim(), DATETIME_FORMAT).map_err(|_| ParseError::BadTimestamp {
        field,
        value: value.to_string(),
    })
}

/// Reads `"3 días"`, `"24 horas"`, `"5 días hábiles"`. Anything else is no limit.
pub fn parse_time_limit(text: &str) -> Option<TimeLimit> {
    let caps = TIME_LIMIT_RE.captures(text)?;
    let amount = caps[1].parse().ok()?;
    let unit = if caps[2].to_lowercase().starts_with('h') {
        TimeUnit::Hours
    } else if caps.get(3).is_some() {
        TimeUnit::BusinessDays
    } else {
        TimeUnit::Days
    };
    Some(TimeLimit { amount, unit })
}

/// HTML table with its header renamed through a fixed label table.
struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn read(src: &str, renames: &[(&str, &str)]) -> Result<Self, ParseError> {
        let document = Html::parse_document(src);
        let table_sel = selector("table")?;
        let row_sel = selector("tr")?;
        let cell_sel = selector("th, td")?;
        let table = document
            .select(&table_sel)
            .next()
            .ok_or_else(|| ParseError::TableShape("no table in export".into()))?;

        let mut rows = table.select(&row_sel).map(|row| {
            row.select(&cell_sel)
                .map(|cell| element_text(cell).unwrap_or_default())
                .collect::<Vec<_>>()
        });
        let headers = rows
            .next()
            .ok_or_else(|| ParseError::TableShape("export has no header row".into()))?
            .into_iter()
            .map(|label| {
                renames
                    .iter()
                    .find(|(source, _)| *source == label)
                    .map(|(_, name)| name.to_string())
                    .unwrap_or(label)
            })
            .collect();
        let rows = rows.filter(|cells| cells.iter().any(|c| !c.is_empty())).collect();
        Ok(Self { headers, rows })
    }

    fn column(&self, name: &str) -> Result<usize, ParseError> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ParseError::TableShape(format!("missing column {name}")))
    }

    fn cell<'a>(&self, row: &'a [String], column: usize) -> Option<&'a str> {
        row.get(column).map(String::as_str).filter(|c| !c.is_empty())
    }
}

fn parse_order(value: &str) -> Result<i64, ParseError> {
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.replace(',', ".").parse::<f64>().ok().map(|v| v as i64))
        .ok_or_else(|| ParseError::TableShape(format!("order value {value:?} is not a number")))
}

fn decode_modal(index: usize, raw: &str) -> Result<ModalPayload, ParseError> {
    let malformed = |reason: String| ParseError::MalformedModal { index, reason };
    let envelope: ModalEnvelope = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    serde_json::from_str(&envelope.d).map_err(|e| malformed(format!("inner payload: {e}")))
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn parse_products(
    document: &Html,
) -> Result<(Vec<Product>, BTreeMap<i64, ProductType>), ParseError> {
    let mut products = Vec::new();
    let mut product_types = BTreeMap::new();
    let row_sel = selector("#gvCategory .dccp-row")?;
    let td_sel = selector("td")?;

    for row in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row.select(&td_sel).collect();
        let [info, summary, amount, ..] = cells.as_slice() else {
            return Err(ParseError::TableShape(format!(
                "product row has {} cells, expected 3",
                cells.len()
            )));
        };

        let type_name =
            select_child_text(*info, ".d-block")?.ok_or(ParseError::MissingField("product type name"))?;
        let code_text =
            select_child_text(*info, ".text-gray")?.ok_or(ParseError::MissingField("product type code"))?;
        let type_code = match code_text.split_whitespace().nth(1).and_then(|t| t.parse().ok()) {
            Some(code) => code,
            None => validate_pro_code(&code_text)?,
        };
        let quantity = match select_child_text(*amount, ".text-font-15")? {
            Some(text) => Some(
                text.replace(',', ".")
                    .parse::<f64>()
                    .map(|q| q as i64)
                    .map_err(|_| ParseError::TableShape(format!("product quantity {text:?}")))?,
            ),
            None => None,
        };
        let title = element_text(*summary).ok_or(ParseError::MissingField("product title"))?;

        product_types.entry(type_code).or_insert_with(|| ProductType {
            code: type_code,
            name: type_name,
        });
        products.push(Product {
            title,
            quantity,
            type_code,
        });
    }
    Ok((products, product_types))
}

fn parse_contact(document: &Html) -> Result<Option<Person>, ParseError> {
    let name = text_by_id(document, "lblDescContacto")?;
    let phone = text_by_id(document, "lblDescTelefono")?
        .and_then(|raw| validate_cl_phone_number(&raw).lenient());
    let email = text_by_id(document, "lblDescEmail")?
        .and_then(|raw| validate_email_address(&raw).lenient());
    if name.is_none() && phone.is_none() && email.is_none() {
        return Ok(None);
    }
    let (names, surnames) = name.map(|n| normalize_full_name(&n)).unwrap_or_default();
    Ok(Some(Person {
        rut: None,
        names,
        surnames,
        phone_numbers: phone.into_iter().collect(),
        email_addresses: email.into_iter().collect(),
    }))
}

fn parse_applications(
    bundle: &RawArtifactBundle,
    document: &Html,
    products: &[Product],
) -> Result<Vec<Application>, ParseError> {
    let Some(listing) = &bundle.provider_listing else {
        return Ok(Vec::new());
    };
    if bundle.modals.is_empty() {
        return Ok(Vec::new());
    }

    let selected_rut: Option<Rut> = match &bundle.selected_modal {
        Some(_) => {
            let text = select_first_text(document, "#gvSeleccionado .declaracion-rutRazonSocial")?
                .ok_or(ParseError::MissingField("selected provider RUT"))?;
            Some(validate_rut(&text)?)
        }
        None => None,
    };

    let table = Table::read(&listing.content, PROVIDER_COLUMNS)?;
    let j_col = table.column("j")?;
    let rut_col = table.column("organization_rut")?;
    let name_col = table.column("organization_name")?;
    let currency_col = table.column("sum_currency")?;
    let total_col = table.column("sum_total")?;
    let unit_col = table.column("sum_per_unit")?;

    let mut max_order = None;
    for row in &table.rows {
        let value = table
            .cell(row, j_col)
            .ok_or_else(|| ParseError::TableShape("row without order value".into()))?;
        let order = parse_order(value)?;
        max_order = Some(max_order.map_or(order, |m: i64| m.max(order)));
    }
    let group_size = match max_order {
        Some(max) if max >= 0 => (max + 1) as usize,
        Some(max) => return Err(ParseError::TableShape(format!("negative order value {max}"))),
        None => 0,
    };
    let groups: Vec<&[Vec<String>]> = if group_size == 0 {
        Vec::new()
    } else {
        table.rows.chunks(group_size).collect()
    };
    if groups.len() != bundle.modals.len() {
        return Err(ParseError::GroupCountMismatch {
            groups: groups.len(),
            modals: bundle.modals.len(),
        });
    }

    let mut applications = Vec::with_capacity(groups.len());
    for (index, (group, raw_modal)) in groups.into_iter().zip(&bundle.modals).enumerate() {
        let modal = decode_modal(index, raw_modal)?;
        let sent_at = NaiveDate::parse_from_str(modal.sent_at.trim(), DATE_FORMAT).map_err(|_| {
            ParseError::BadTimestamp {
                field: "application sent date",
                value: modal.sent_at.clone(),
            }
        })?;

        let (summary_row, product_rows) = group
            .split_first()
            .ok_or_else(|| ParseError::TableShape("empty provider group".into()))?;
        let rut_text = table
            .cell(summary_row, rut_col)
            .ok_or(ParseError::MissingField("provider RUT"))?;
        let organization_rut = validate_rut(rut_text)?;
        let organization_name = table
            .cell(summary_row, name_col)
            .ok_or(ParseError::MissingField("provider name"))?
            .to_string();
        let currency = table
            .cell(summary_row, currency_col)
            .ok_or(ParseError::MissingField("provider currency"))?;
        let total_sum = parse_money(
            currency,
            table
                .cell(summary_row, total_col)
                .ok_or(ParseError::MissingField("provider total"))?,
        )?;

        let mut quoted = Vec::with_capacity(product_rows.len());
        for (product_index, row) in product_rows.iter().enumerate() {
            if product_index >= products.len() {
                return Err(ParseError::TableShape(format!(
                    "provider {organization_rut} quotes product #{product_index} but the bid lists {}",
                    products.len()
                )));
            }
            let unit = table
                .cell(row, unit_col)
                .ok_or(ParseError::MissingField("quoted unit price"))?;
            quoted.push(ApplicationProduct {
                product_index,
                sum: parse_money(currency, unit)?,
            });
        }

        let accepted = selected_rut.as_ref().map(|selected| *selected == organization_rut);
        applications.push(Application {
            organization: OrganizationName {
                organization_rut,
                name: organization_name,
            },
            products: quoted,
            total_sum,
            accepted,
            sent_at,
            summary: modal.description.and_then(text_or_none),
        });
    }
    Ok(applications)
}

fn parse_buying_order(html: &str, applications: &[Application]) -> Result<BuyingOrder, ParseError> {
    let document = Html::parse_document(html);
    let idn = required_by_id(&document, "lblNumOC", "buying order identifier")?;
    let published_at = match text_by_id(&document, "lblFecEnvio")? {
        Some(text) => {
            let parsed = NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT).ok().or_else(|| {
                NaiveDate::parse_from_str(&text, DATE_FORMAT)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            });
            Some(parsed.ok_or(ParseError::BadTimestamp {
                field: "buying order date",
                value: text,
            })?)
        }
        None => None,
    };
    Ok(BuyingOrder {
        idn,
        published_at,
        notes: text_by_id(&document, "lblObservaciones")?,
        application_index: applications.iter().position(|a| a.accepted == Some(true)),
    })
}

/// Parses one crawled listing into its domain graph.
pub fn parse_listing(bundle: &RawArtifactBundle) -> Result<ParsedListing, ParseError> {
    let document = Html::parse_document(&bundle.main_html);

    let idn = required_by_id(&document, "lblExternalCodeQuote", "listing identifier")?;
    if idn != bundle.idn {
        return Err(ParseError::IdentifierMismatch {
            expected: bundle.idn.clone(),
            found: idn,
        });
    }
    let title = required_by_id(&document, "lblTextName", "title")?;
    let summary = text_by_id(&document, "lblTextDescription")?;
    let published_at = parse_datetime(
        "published_at",
        &required_by_id(&document, "lblFechaPublicacion", "published_at")?,
    )?;
    let closed_at = parse_datetime(
        "closed_at",
        &required_by_id(&document, "lblFechaCierre", "closed_at")?,
    )?;
    let time_limit = text_by_id(&document, "lblPlazoEntrega")?.and_then(|t| parse_time_limit(&t));
    let sum = parse_money(
        &required_by_id(&document, "lblMonedaSymbol", "currency")?,
        &required_by_id(&document, "lblMontoTotalDisponible", "total amount")?,
    )?;
    let status_text = required_by_id(&document, "lblrstStatus", "status")?;
    let status =
        BidStatus::from_portal_label(&status_text).ok_or(ParseError::UnknownStatus(status_text))?;

    let organization_rut = validate_rut(&required_by_id(&document, "lblRutOrganismo", "organization RUT")?)?;
    let organization = OrganizationName {
        organization_rut: organization_rut.clone(),
        name: required_by_id(&document, "lblNombreOrganismo", "organization name")?,
    };
    let mut organizations = vec![Organization {
        rut: organization_rut,
    }];
    let mut organization_names = vec![organization.clone()];

    let (products, product_types) = parse_products(&document)?;
    let contact = parse_contact(&document)?;
    let applications = parse_applications(bundle, &document, &products)?;
    for application in &applications {
        push_unique(
            &mut organizations,
            Organization {
                rut: application.organization.organization_rut.clone(),
            },
        );
        push_unique(&mut organization_names, application.organization.clone());
    }
    let buying_order = bundle
        .buying_order_html
        .as_deref()
        .map(|html| parse_buying_order(html, &applications))
        .transpose()?;

    Ok(ParsedListing {
        bid: Bid {
            idn,
            kind: BidKind::Agile,
            title,
            summary,
            status,
            published_at,
            closed_at,
            time_limit,
            sum,
            organization,
            products,
            contact,
            buying_order,
            applications,
        },
        product_types,
        organizations,
        organization_names,
    })
}

/// Parses the search export. Row order is kept and repeated identifiers keep
/// their first position.
pub fn parse_search_results(src: &str) -> Result<Vec<SearchResult>, ParseError> {
    let table = Table::read(src, SEARCH_COLUMNS)?;
    let idn_col = table.column("idn")?;
    let optional = |name: &str| table.headers.iter().position(|h| h == name);
    let name_col = optional("name");
    let unit_col = optional("buying_unit");
    let published_col = optional("published_at");
    let closed_col = optional("closed_at");
    let status_col = optional("status");
    let sent_col = optional("sent_applications");
    let org_col = optional("organization_name");

    let text = |row: &[String], col: Option<usize>| col.and_then(|c| table.cell(row, c)).map(str::to_string);
    let date = |row: &[String], col: Option<usize>| {
        let raw = text(row, col)?;
        let parsed = SEARCH_DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&raw, fmt).ok());
        if parsed.is_none() {
            debug!(value = %raw, "unrecognized date in search export");
        }
        parsed
    };

    let mut seen = HashSet::new();
    let mut results = Vec::new();
    for row in &table.rows {
        let Some(idn) = table.cell(row, idn_col) else {
            continue;
        };
        if !seen.insert(idn.to_string()) {
            continue;
        }
        results.push(SearchResult {
            idn: idn.to_string(),
            name: text(row, name_col),
            buying_unit: text(row, unit_col),
            published_at: date(row, published_col),
            closed_at: date(row, closed_col),
            status: text(row, status_col).and_then(|s| BidStatus::from_portal_label(&s)),
            sent_applications: text(row, sent_col).and_then(|s| s.parse().ok()),
            organization_name: text(row, org_col),
        });
    }
    Ok(results)
}
