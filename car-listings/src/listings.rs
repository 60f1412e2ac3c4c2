//! Car listing operations: create, owner-scoped fetch, partial update, delete and global search.

use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::{
    images::ImageProcessor,
    models::{now, AppError, Car, CarImage, CarView},
    repository::CarRepository,
    search::CarQuery,
};

/// Maximum number of photos accepted in one request.
pub const MAX_PHOTOS: usize = 10;
/// Maximum size of a single photo, in bytes.
pub const MAX_PHOTO_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct NewListing {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub photos: Vec<CarImage>,
}

/// Fields left as `None` are not touched.
#[derive(Debug, Clone, Default)]
pub struct ListingPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    /// When present, existing images not named here are dropped.
    pub keep_image_ids: Option<Vec<Uuid>>,
    pub new_photos: Vec<CarImage>,
}

/// Enforce the per-request photo limits.
pub fn check_photos(photos: &[CarImage]) -> Result<(), AppError> {
    if photos.len() > MAX_PHOTOS {
        return Err(AppError::PayloadTooLarge(format!("at most {} photos per request", MAX_PHOTOS)));
    }
    if let Some(big) = photos.iter().find(|p| p.data.len() > MAX_PHOTO_BYTES) {
        return Err(AppError::PayloadTooLarge(format!("photo of {} bytes exceeds the {} byte limit", big.data.len(), MAX_PHOTO_BYTES)));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct ListingService {
    cars: Arc<dyn CarRepository>,
    images: ImageProcessor,
}

impl ListingService {
    pub fn new(cars: Arc<dyn CarRepository>, images: ImageProcessor) -> Self { Self { cars, images } }

    pub async fn add(&self, owner_id: Uuid, input: NewListing) -> Result<Car, AppError> {
        let (title, description) = match (non_blank(input.title), non_blank(input.description)) {
            (Some(t), Some(d)) => (t, d),
            _ => return Err(AppError::Validation("title and description are required".into())),
        };
        check_photos(&input.photos)?;
        let stamp = now();
        let car = Car { id: Uuid::new_v4(), owner_id, title, description, tags: input.tags, images: input.photos, created_at: stamp, updated_at: stamp };
        let car = self.cars.create(car).await?;
        tracing::info!(car_id = %car.id, owner_id = %owner_id, photos = car.images.len(), "car listing created");
        Ok(car)
    }

    /// The caller's listings, optionally narrowed to one id and/or a keyword.
    pub async fn list(&self, owner_id: Uuid, car_id: Option<Uuid>, keyword: Option<&str>) -> Result<Vec<CarView>, AppError> {
        self.render(&CarQuery::owned_by(owner_id).with_car_id(car_id).with_keyword(keyword)).await
    }

    /// Keyword search across every owner's listings.
    pub async fn global_search(&self, keyword: Option<&str>) -> Result<Vec<CarView>, AppError> {
        self.render(&CarQuery::everyone().with_keyword(keyword)).await
    }

    /// Run a query and render its images. A single-listing query fails outright on an
    /// unreadable image; multi-listing results drop the affected listing and log it.
    async fn render(&self, query: &CarQuery) -> Result<Vec<CarView>, AppError> {
        let cars = self.cars.search(query).await?;
        let rendered = join_all(cars.into_iter().map(|mut car| async move {
            let id = car.id;
            let images = std::mem::take(&mut car.images);
            let result = self.images.render_all(&images).await.map(|rendered| CarView::with_images(car, rendered));
            (id, result)
        }))
        .await;

        let mut views = Vec::with_capacity(rendered.len());
        for (car_id, result) in rendered {
            match result {
                Ok(view) => views.push(view),
                Err(e) if query.is_single() => return Err(e),
                Err(e) => tracing::error!(car_id = %car_id, error = %e, "skipping listing with unreadable images"),
            }
        }
        Ok(views)
    }

    pub async fn update(&self, owner_id: Uuid, car_id: Uuid, patch: ListingPatch) -> Result<Car, AppError> {
        check_photos(&patch.new_photos)?;
        let mut car = self.owned(owner_id, car_id).await?;
        if let Some(title) = non_blank(patch.title) { car.title = title; }
        if let Some(description) = non_blank(patch.description) { car.description = description; }
        if let Some(tags) = patch.tags { car.tags = tags; }
        // Filter before appending so photos uploaded in this request always survive.
        if let Some(keep) = patch.keep_image_ids {
            car.images.retain(|image| keep.contains(&image.id));
        }
        car.images.extend(patch.new_photos);
        car.updated_at = now();
        self.cars.update(car).await
    }

    pub async fn delete(&self, owner_id: Uuid, car_id: Uuid) -> Result<(), AppError> {
        self.owned(owner_id, car_id).await?;
        if !self.cars.delete(car_id).await? {
            return Err(AppError::NotFound("car not found".into()));
        }
        tracing::info!(car_id = %car_id, "car listing deleted");
        Ok(())
    }

    /// Someone else's listing is reported as missing rather than forbidden.
    async fn owned(&self, owner_id: Uuid, car_id: Uuid) -> Result<Car, AppError> {
        match self.cars.find_by_id(car_id).await? {
            Some(car) if car.owner_id == owner_id => Ok(car),
            _ => Err(AppError::NotFound("car not found".into())),
        }
    }
}
