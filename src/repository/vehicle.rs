use std::collections::HashMap;

use bytemuck::cast_slice;
use diesel::prelude::*;
use diesel::result::QueryResult;

use crate::db::DbConnection;
use crate::domain::search::ConstraintSet;
use crate::domain::vehicle::{NewVehicle, Vehicle, VehicleUpdate, Vocabulary};
use crate::models::schema::{app_state, vehicle_images, vehicle_sources, vehicles};
use crate::models::vehicle::{
    DbVehicle, DbVehicleSource, NewDbVehicle, NewDbVehicleImage, NewDbVehicleSource,
};
use crate::repository::{
    DieselRepository, HarvestGuard, RepositoryError, RepositoryResult, VehicleReader,
    VehicleWriter,
};

fn replace_vehicle_images(
    conn: &mut DbConnection,
    vehicle_id: i32,
    image_urls: &[String],
) -> QueryResult<()> {
    diesel::delete(vehicle_images::table.filter(vehicle_images::vehicle_id.eq(vehicle_id)))
        .execute(conn)?;

    if image_urls.is_empty() {
        return Ok(());
    }

    let new_images = image_urls
        .iter()
        .enumerate()
        .map(|(position, url)| NewDbVehicleImage {
            vehicle_id,
            url: url.clone(),
            position: position as i32,
        })
        .collect::<Vec<_>>();

    diesel::insert_into(vehicle_images::table)
        .values(&new_images)
        .execute(conn)?;

    Ok(())
}

fn replace_vehicle_sources(
    conn: &mut DbConnection,
    vehicle_id: i32,
    sources: &[crate::domain::vehicle::SourceRef],
) -> QueryResult<()> {
    diesel::delete(vehicle_sources::table.filter(vehicle_sources::vehicle_id.eq(vehicle_id)))
        .execute(conn)?;

    let new_sources = sources
        .iter()
        .map(|source| NewDbVehicleSource {
            vehicle_id,
            source_id: source.source_id.clone(),
            external_id: source.external_id.clone(),
            url: source.url.clone(),
            scraped_at: source.scraped_at.naive_utc(),
        })
        .collect::<Vec<_>>();

    diesel::insert_into(vehicle_sources::table)
        .values(&new_sources)
        .execute(conn)?;

    Ok(())
}

/// Attach sources and images to a loaded page of vehicle rows.
fn hydrate(conn: &mut DbConnection, rows: Vec<DbVehicle>) -> QueryResult<Vec<Vehicle>> {
    let ids: Vec<i32> = rows.iter().map(|row| row.id).collect();

    let mut sources_by_vehicle: HashMap<i32, Vec<DbVehicleSource>> = HashMap::new();
    let mut images_by_vehicle: HashMap<i32, Vec<String>> = HashMap::new();
    if !ids.is_empty() {
        let sources = vehicle_sources::table
            .filter(vehicle_sources::vehicle_id.eq_any(&ids))
            .load::<DbVehicleSource>(conn)?;
        for source in sources {
            sources_by_vehicle
                .entry(source.vehicle_id)
                .or_default()
                .push(source);
        }

        let images = vehicle_images::table
            .filter(vehicle_images::vehicle_id.eq_any(&ids))
            .order(vehicle_images::position.asc())
            .load::<crate::models::vehicle::DbVehicleImage>(conn)?;
        for image in images {
            images_by_vehicle
                .entry(image.vehicle_id)
                .or_default()
                .push(image.url);
        }
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let sources = sources_by_vehicle.remove(&row.id).unwrap_or_default();
            let images = images_by_vehicle.remove(&row.id).unwrap_or_default();
            row.into_domain(sources, images)
        })
        .collect())
}

impl VehicleReader for DieselRepository {
    fn list_active(&self) -> RepositoryResult<Vec<Vehicle>> {
        let mut conn = self.conn()?;

        let rows = vehicles::table
            .filter(vehicles::is_active.eq(true))
            .order(vehicles::id.asc())
            .load::<DbVehicle>(&mut conn)?;

        Ok(hydrate(&mut conn, rows)?)
    }

    fn list_all(&self) -> RepositoryResult<Vec<Vehicle>> {
        let mut conn = self.conn()?;

        let rows = vehicles::table
            .order(vehicles::id.asc())
            .load::<DbVehicle>(&mut conn)?;

        Ok(hydrate(&mut conn, rows)?)
    }

    fn query_candidates(&self, constraints: &ConstraintSet) -> RepositoryResult<Vec<Vehicle>> {
        let mut conn = self.conn()?;

        let mut query = vehicles::table
            .filter(vehicles::is_active.eq(true))
            .filter(vehicles::embedding.is_not_null())
            .into_boxed();

        // SQLite LIKE is case-insensitive for ASCII, which gives
        // case-insensitive equality without a lower() round trip.
        if let Some(brand) = &constraints.brand {
            query = query.filter(vehicles::brand.like(brand.clone()));
        }
        if let Some(model) = &constraints.model {
            // Substring match so "4Runner" also finds "4Runner Limited".
            query = query.filter(vehicles::model.like(format!("%{model}%")));
        }
        if let Some(year_min) = constraints.year_min {
            query = query.filter(vehicles::year.ge(year_min));
        }
        if let Some(year_max) = constraints.year_max {
            query = query.filter(vehicles::year.le(year_max));
        }
        if let Some(price_max) = constraints.price_max_usd {
            query = query.filter(vehicles::price_usd.le(price_max));
        }

        let rows = query.order(vehicles::id.asc()).load::<DbVehicle>(&mut conn)?;

        Ok(hydrate(&mut conn, rows)?)
    }

    fn list_pending_embedding(&self) -> RepositoryResult<Vec<Vehicle>> {
        let mut conn = self.conn()?;

        let rows = vehicles::table
            .filter(vehicles::is_active.eq(true))
            .filter(vehicles::embedding.is_null())
            .order(vehicles::id.asc())
            .load::<DbVehicle>(&mut conn)?;

        Ok(hydrate(&mut conn, rows)?)
    }

    fn vocabulary(&self) -> RepositoryResult<Vocabulary> {
        let mut conn = self.conn()?;

        let brands: Vec<String> = vehicles::table
            .filter(vehicles::is_active.eq(true))
            .select(vehicles::brand)
            .distinct()
            .load(&mut conn)?;
        let models: Vec<String> = vehicles::table
            .filter(vehicles::is_active.eq(true))
            .select(vehicles::model)
            .distinct()
            .load(&mut conn)?;

        Ok(Vocabulary {
            brands: brands.into_iter().map(|b| b.to_lowercase()).collect(),
            models: models.into_iter().map(|m| m.to_lowercase()).collect(),
        })
    }
}

impl VehicleWriter for DieselRepository {
    fn create_vehicles(&self, new_vehicles: &[NewVehicle]) -> RepositoryResult<usize> {
        if new_vehicles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let inserted = conn.transaction(|conn| {
            let mut inserted_rows = 0;
            for vehicle in new_vehicles {
                let row: NewDbVehicle = vehicle.into();
                let vehicle_id = diesel::insert_into(vehicles::table)
                    .values(&row)
                    .returning(vehicles::id)
                    .get_result::<i32>(conn)?;
                replace_vehicle_sources(conn, vehicle_id, &vehicle.sources)?;
                replace_vehicle_images(conn, vehicle_id, &vehicle.images)?;
                inserted_rows += 1;
            }
            Ok::<usize, RepositoryError>(inserted_rows)
        })?;

        Ok(inserted)
    }

    fn apply_merges(&self, updates: &[VehicleUpdate]) -> RepositoryResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let affected = conn.transaction(|conn| {
            let mut affected_rows = 0;
            for update in updates {
                let row: NewDbVehicle = update.into();
                // Re-sighting a vehicle resets missed_cycles and reactivates
                // it; the changeset carries both.
                if update.embedding_stale {
                    diesel::update(vehicles::table.filter(vehicles::id.eq(update.id)))
                        .set((&row, vehicles::embedding.eq(None::<Vec<u8>>)))
                        .execute(conn)?;
                } else {
                    diesel::update(vehicles::table.filter(vehicles::id.eq(update.id)))
                        .set(&row)
                        .execute(conn)?;
                }
                replace_vehicle_sources(conn, update.id, &update.sources)?;
                replace_vehicle_images(conn, update.id, &update.images)?;
                affected_rows += 1;
            }
            Ok::<usize, RepositoryError>(affected_rows)
        })?;

        Ok(affected)
    }

    fn set_embedding(&self, vehicle_id: i32, embedding: &[f32]) -> RepositoryResult<usize> {
        let mut conn = self.conn()?;

        let blob: Vec<u8> = cast_slice(embedding).to_vec();

        let affected = diesel::update(vehicles::table.filter(vehicles::id.eq(vehicle_id)))
            .set(vehicles::embedding.eq(blob))
            .execute(&mut conn)?;

        Ok(affected)
    }

    fn retire_unseen(&self, seen_ids: &[i32], retention_cycles: i32) -> RepositoryResult<usize> {
        let mut conn = self.conn()?;

        let deactivated = conn.transaction(|conn| {
            diesel::update(
                vehicles::table
                    .filter(vehicles::is_active.eq(true))
                    .filter(vehicles::id.ne_all(seen_ids)),
            )
            .set(vehicles::missed_cycles.eq(vehicles::missed_cycles + 1))
            .execute(conn)?;

            diesel::update(
                vehicles::table
                    .filter(vehicles::is_active.eq(true))
                    .filter(vehicles::missed_cycles.ge(retention_cycles)),
            )
            .set(vehicles::is_active.eq(false))
            .execute(conn)
        })?;

        Ok(deactivated)
    }
}

impl HarvestGuard for DieselRepository {
    fn claim_harvest_lock(&self) -> RepositoryResult<bool> {
        let mut conn = self.conn()?;

        let claimed = conn.transaction(|conn| {
            diesel::insert_or_ignore_into(app_state::table)
                .values((app_state::id.eq(1), app_state::harvesting.eq(false)))
                .execute(conn)?;

            let affected = diesel::update(
                app_state::table
                    .filter(app_state::id.eq(1))
                    .filter(app_state::harvesting.eq(false)),
            )
            .set(app_state::harvesting.eq(true))
            .execute(conn)?;

            Ok::<bool, RepositoryError>(affected == 1)
        })?;

        Ok(claimed)
    }

    fn release_harvest_lock(&self) -> RepositoryResult<()> {
        let mut conn = self.conn()?;

        diesel::update(app_state::table.filter(app_state::id.eq(1)))
            .set(app_state::harvesting.eq(false))
            .execute(&mut conn)?;

        Ok(())
    }
}
