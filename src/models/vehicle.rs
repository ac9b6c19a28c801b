//! Diesel row types for the catalog tables and conversions to the domain
//! model.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::domain::vehicle::{NewVehicle, SourceRef, Vehicle, VehicleContent, VehicleUpdate};
use crate::models::schema::{vehicle_images, vehicle_sources, vehicles};

#[derive(Debug, Queryable, Identifiable)]
#[diesel(table_name = vehicles)]
pub struct DbVehicle {
    pub id: i32,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price_usd: f64,
    pub mileage: Option<i32>,
    pub transmission: Option<String>,
    pub fuel_type: Option<String>,
    pub color: Option<String>,
    pub location: Option<String>,
    pub description: String,
    pub contact: Option<String>,
    pub url: String,
    pub embedding: Option<Vec<u8>>,
    pub content_hash: String,
    pub last_seen_at: NaiveDateTime,
    pub missed_cycles: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = vehicles)]
pub struct NewDbVehicle {
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price_usd: f64,
    pub mileage: Option<i32>,
    pub transmission: Option<String>,
    pub fuel_type: Option<String>,
    pub color: Option<String>,
    pub location: Option<String>,
    pub description: String,
    pub contact: Option<String>,
    pub url: String,
    pub content_hash: String,
    pub last_seen_at: NaiveDateTime,
    pub missed_cycles: i32,
    pub is_active: bool,
}

#[derive(Debug, Queryable)]
pub struct DbVehicleSource {
    pub id: i32,
    pub vehicle_id: i32,
    pub source_id: String,
    pub external_id: String,
    pub url: String,
    pub scraped_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = vehicle_sources)]
pub struct NewDbVehicleSource {
    pub vehicle_id: i32,
    pub source_id: String,
    pub external_id: String,
    pub url: String,
    pub scraped_at: NaiveDateTime,
}

#[derive(Debug, Queryable)]
pub struct DbVehicleImage {
    pub id: i32,
    pub vehicle_id: i32,
    pub url: String,
    pub position: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = vehicle_images)]
pub struct NewDbVehicleImage {
    pub vehicle_id: i32,
    pub url: String,
    pub position: i32,
}

/// SQLite hands the embedding back as an arbitrary-alignment byte vector, so
/// the bytes are reassembled explicitly instead of cast in place.
pub fn embedding_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn content_from_row(row: &DbVehicle) -> VehicleContent {
    VehicleContent {
        brand: row.brand.clone(),
        model: row.model.clone(),
        year: row.year,
        price_usd: row.price_usd,
        mileage: row.mileage,
        transmission: row.transmission.as_deref().and_then(|t| t.parse().ok()),
        fuel_type: row.fuel_type.as_deref().and_then(|f| f.parse().ok()),
        color: row.color.clone(),
        location: row.location.clone(),
        description: row.description.clone(),
        contact: row.contact.clone(),
        url: row.url.clone(),
    }
}

impl DbVehicle {
    pub fn into_domain(self, sources: Vec<DbVehicleSource>, images: Vec<String>) -> Vehicle {
        let content = content_from_row(&self);
        Vehicle {
            id: self.id,
            content,
            images,
            sources: sources
                .into_iter()
                .map(|s| SourceRef {
                    source_id: s.source_id,
                    external_id: s.external_id,
                    url: s.url,
                    scraped_at: s.scraped_at.and_utc(),
                })
                .collect(),
            embedding: self.embedding.as_deref().map(embedding_from_blob),
            content_hash: self.content_hash,
            last_seen_at: self.last_seen_at.and_utc(),
            missed_cycles: self.missed_cycles,
            is_active: self.is_active,
        }
    }
}

fn row_from_content(
    content: &VehicleContent,
    content_hash: &str,
    last_seen_at: NaiveDateTime,
) -> NewDbVehicle {
    NewDbVehicle {
        brand: content.brand.clone(),
        model: content.model.clone(),
        year: content.year,
        price_usd: content.price_usd,
        mileage: content.mileage,
        transmission: content.transmission.map(|t| t.as_str().to_string()),
        fuel_type: content.fuel_type.map(|f| f.as_str().to_string()),
        color: content.color.clone(),
        location: content.location.clone(),
        description: content.description.clone(),
        contact: content.contact.clone(),
        url: content.url.clone(),
        content_hash: content_hash.to_string(),
        last_seen_at,
        missed_cycles: 0,
        is_active: true,
    }
}

impl From<&NewVehicle> for NewDbVehicle {
    fn from(vehicle: &NewVehicle) -> Self {
        row_from_content(
            &vehicle.content,
            &vehicle.content_hash,
            vehicle.last_seen_at.naive_utc(),
        )
    }
}

impl From<&VehicleUpdate> for NewDbVehicle {
    fn from(update: &VehicleUpdate) -> Self {
        row_from_content(
            &update.content,
            &update.content_hash,
            update.last_seen_at.naive_utc(),
        )
    }
}
