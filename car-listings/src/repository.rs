//! Persistence layer: async repository traits with PostgreSQL and in-memory implementations.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{models::{AppError, Car, CarImage, User}, search::CarQuery};

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with `Conflict` when the username or email is taken.
    async fn create(&self, user: User) -> Result<User, AppError>;
    async fn find_by_id(&self, id: Uuid) -> Result<User, AppError>;
    /// Look a user up by email or username (either column may match).
    async fn find_by_login(&self, identifier: &str) -> Result<Option<User>, AppError>;
    async fn exists(&self, username: &str, email: &str) -> Result<bool, AppError>;
}

#[async_trait]
pub trait CarRepository: Send + Sync {
    async fn create(&self, car: Car) -> Result<Car, AppError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Car>, AppError>;
    async fn search(&self, query: &CarQuery) -> Result<Vec<Car>, AppError>;
    /// Overwrite every field and the full image list of an existing listing.
    async fn update(&self, car: Car) -> Result<Car, AppError>;
    /// Returns false when nothing was deleted.
    async fn delete(&self, id: Uuid) -> Result<bool, AppError>;
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        created_at: row.get("created_at"),
    }
}

#[derive(Clone)]
pub struct PostgresUserRepository { pub pool: PgPool }
impl PostgresUserRepository { pub fn new(pool: PgPool) -> Self { Self { pool } } }

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create(&self, user: User) -> Result<User, AppError> {
        let row = sqlx::query(
            r#"INSERT INTO users (id, username, email, password_hash, created_at)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id, username, email, password_hash, created_at"#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict("username or email already exists".into()),
            _ => AppError::Repo(e.to_string()),
        })?;
        Ok(user_from_row(&row))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<User, AppError> {
        let row = sqlx::query(r#"SELECT id, username, email, password_hash, created_at FROM users WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).ok_or(AppError::UserNotFound)
    }

    async fn find_by_login(&self, identifier: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query(
            r#"SELECT id, username, email, password_hash, created_at FROM users
               WHERE lower(email) = lower($1) OR username = $1
               LIMIT 1"#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn exists(&self, username: &str, email: &str) -> Result<bool, AppError> {
        let row = sqlx::query(r#"SELECT EXISTS(SELECT 1 FROM users WHERE username = $1 OR lower(email) = lower($2))"#)
            .bind(username)
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<bool, _>(0))
    }
}

#[derive(Clone)]
pub struct PostgresCarRepository { pub pool: PgPool }
impl PostgresCarRepository { pub fn new(pool: PgPool) -> Self { Self { pool } } }

impl PostgresCarRepository {
    async fn insert_images(tx: &mut sqlx::Transaction<'_, Postgres>, car_id: Uuid, images: &[CarImage]) -> Result<(), AppError> {
        for (position, image) in images.iter().enumerate() {
            sqlx::query(r#"INSERT INTO car_images (id, car_id, position, content_type, data) VALUES ($1, $2, $3, $4, $5)"#)
                .bind(image.id)
                .bind(car_id)
                .bind(position as i32)
                .bind(&image.content_type)
                .bind(&image.data)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    /// Attach images (in stored order) to the given car rows.
    async fn load_images(&self, cars: &mut [Car]) -> Result<(), AppError> {
        if cars.is_empty() { return Ok(()); }
        let ids: Vec<Uuid> = cars.iter().map(|c| c.id).collect();
        let rows = sqlx::query(
            r#"SELECT id, car_id, content_type, data FROM car_images
               WHERE car_id = ANY($1)
               ORDER BY car_id, position"#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        let mut by_car: HashMap<Uuid, Vec<CarImage>> = HashMap::new();
        for row in rows {
            by_car.entry(row.get("car_id")).or_default().push(CarImage {
                id: row.get("id"),
                content_type: row.get("content_type"),
                data: row.get("data"),
            });
        }
        for car in cars.iter_mut() {
            car.images = by_car.remove(&car.id).unwrap_or_default();
        }
        Ok(())
    }
}

fn car_from_row(row: &PgRow) -> Car {
    Car {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        description: row.get("description"),
        tags: row.get("tags"),
        images: Vec::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl CarRepository for PostgresCarRepository {
    async fn create(&self, car: Car) -> Result<Car, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO cars (id, owner_id, title, description, tags, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(car.id)
        .bind(car.owner_id)
        .bind(&car.title)
        .bind(&car.description)
        .bind(&car.tags)
        .bind(car.created_at)
        .bind(car.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => AppError::Unauthorized("unknown owner".into()),
            _ => AppError::Repo(e.to_string()),
        })?;
        Self::insert_images(&mut tx, car.id, &car.images).await?;
        tx.commit().await?;
        Ok(car)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Car>, AppError> {
        let mut cars = self.search(&CarQuery::everyone().with_car_id(Some(id))).await?;
        Ok(cars.pop())
    }

    async fn search(&self, query: &CarQuery) -> Result<Vec<Car>, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT c.id, c.owner_id, c.title, c.description, c.tags, c.created_at, c.updated_at FROM cars c WHERE TRUE",
        );
        query.push_sql(&mut qb);
        qb.push(" ORDER BY c.created_at ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut cars: Vec<Car> = rows.iter().map(car_from_row).collect();
        self.load_images(&mut cars).await?;
        Ok(cars)
    }

    async fn update(&self, car: Car) -> Result<Car, AppError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"UPDATE cars SET title = $2, description = $3, tags = $4, updated_at = $5
               WHERE id = $1"#,
        )
        .bind(car.id)
        .bind(&car.title)
        .bind(&car.description)
        .bind(&car.tags)
        .bind(car.updated_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 { return Err(AppError::NotFound("car not found".into())); }
        sqlx::query("DELETE FROM car_images WHERE car_id = $1").bind(car.id).execute(&mut *tx).await?;
        Self::insert_images(&mut tx, car.id, &car.images).await?;
        tx.commit().await?;
        Ok(car)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let rows = sqlx::query("DELETE FROM cars WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(rows.rows_affected() > 0)
    }
}

/// In-memory user store, used for development fallback and tests.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository { inner: Arc<RwLock<HashMap<Uuid, User>>> }
impl InMemoryUserRepository { pub fn new() -> Self { Self::default() } }

fn same_login(u: &User, identifier: &str) -> bool {
    u.email.eq_ignore_ascii_case(identifier) || u.username == identifier
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: User) -> Result<User, AppError> {
        let mut map = self.inner.write().await;
        if map.values().any(|u| u.username == user.username || u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(AppError::Conflict("username or email already exists".into()));
        }
        map.insert(user.id, user.clone());
        Ok(user)
    }
    async fn find_by_id(&self, id: Uuid) -> Result<User, AppError> {
        let map = self.inner.read().await;
        map.get(&id).cloned().ok_or(AppError::UserNotFound)
    }
    async fn find_by_login(&self, identifier: &str) -> Result<Option<User>, AppError> {
        let map = self.inner.read().await;
        Ok(map.values().find(|u| same_login(u, identifier)).cloned())
    }
    async fn exists(&self, username: &str, email: &str) -> Result<bool, AppError> {
        let map = self.inner.read().await;
        Ok(map.values().any(|u| u.username == username || u.email.eq_ignore_ascii_case(email)))
    }
}

/// In-memory listing store; keeps insertion order so results match the SQL ordering.
#[derive(Debug, Default)]
pub struct InMemoryCarRepository { inner: Arc<RwLock<Vec<Car>>> }
impl InMemoryCarRepository { pub fn new() -> Self { Self::default() } }

#[async_trait]
impl CarRepository for InMemoryCarRepository {
    async fn create(&self, car: Car) -> Result<Car, AppError> {
        let mut cars = self.inner.write().await;
        cars.push(car.clone());
        Ok(car)
    }
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Car>, AppError> {
        let cars = self.inner.read().await;
        Ok(cars.iter().find(|c| c.id == id).cloned())
    }
    async fn search(&self, query: &CarQuery) -> Result<Vec<Car>, AppError> {
        let cars = self.inner.read().await;
        Ok(cars.iter().filter(|c| query.matches(c)).cloned().collect())
    }
    async fn update(&self, car: Car) -> Result<Car, AppError> {
        let mut cars = self.inner.write().await;
        let slot = cars.iter_mut().find(|c| c.id == car.id).ok_or_else(|| AppError::NotFound("car not found".into()))?;
        *slot = car.clone();
        Ok(car)
    }
    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let mut cars = self.inner.write().await;
        let before = cars.len();
        cars.retain(|c| c.id != id);
        Ok(cars.len() < before)
    }
}

/// Both repositories, built against the same backend.
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub cars: Arc<dyn CarRepository>,
}

#[derive(Debug, Clone)]
pub struct RepositoryFactory;
impl RepositoryFactory {
    pub fn postgres(pool: PgPool) -> Repositories {
        Repositories { users: Arc::new(PostgresUserRepository::new(pool.clone())), cars: Arc::new(PostgresCarRepository::new(pool)) }
    }
    pub fn in_memory() -> Repositories {
        Repositories { users: Arc::new(InMemoryUserRepository::new()), cars: Arc::new(InMemoryCarRepository::new()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now;

    fn user(username: &str, email: &str) -> User {
        User { id: Uuid::new_v4(), username: username.into(), email: email.into(), password_hash: "hash".into(), created_at: now() }
    }

    fn car(owner: Uuid, title: &str) -> Car {
        Car { id: Uuid::new_v4(), owner_id: owner, title: title.into(), description: "d".into(), tags: vec![], images: vec![], created_at: now(), updated_at: now() }
    }

    #[tokio::test]
    async fn users_conflict_on_username_or_email() {
        let repo = InMemoryUserRepository::new();
        repo.create(user("alice", "alice@example.com")).await.unwrap();
        assert!(matches!(repo.create(user("alice", "other@example.com")).await, Err(AppError::Conflict(_))));
        assert!(matches!(repo.create(user("bob", "ALICE@example.com")).await, Err(AppError::Conflict(_))));
        assert!(repo.exists("carol", "alice@example.com").await.unwrap());
        assert!(!repo.exists("carol", "carol@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn users_found_by_email_or_username() {
        let repo = InMemoryUserRepository::new();
        let alice = repo.create(user("alice", "alice@example.com")).await.unwrap();
        assert_eq!(repo.find_by_login("alice").await.unwrap().unwrap().id, alice.id);
        assert_eq!(repo.find_by_login("Alice@Example.com").await.unwrap().unwrap().id, alice.id);
        assert!(repo.find_by_login("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cars_crud_in_memory() {
        let repo = InMemoryCarRepository::new();
        let owner = Uuid::new_v4();
        let first = repo.create(car(owner, "Blue Sedan")).await.unwrap();
        repo.create(car(owner, "Red Truck")).await.unwrap();
        repo.create(car(Uuid::new_v4(), "Blue Van")).await.unwrap();

        let mine = repo.search(&CarQuery::owned_by(owner)).await.unwrap();
        assert_eq!(mine.iter().map(|c| c.title.as_str()).collect::<Vec<_>>(), vec!["Blue Sedan", "Red Truck"]);
        assert_eq!(repo.search(&CarQuery::everyone().with_keyword(Some("blue"))).await.unwrap().len(), 2);

        let mut edited = first.clone();
        edited.title = "Green Sedan".into();
        repo.update(edited).await.unwrap();
        assert_eq!(repo.find_by_id(first.id).await.unwrap().unwrap().title, "Green Sedan");

        assert!(repo.delete(first.id).await.unwrap());
        assert!(!repo.delete(first.id).await.unwrap());
        assert!(repo.find_by_id(first.id).await.unwrap().is_none());
        assert!(matches!(repo.update(first).await, Err(AppError::NotFound(_))));
    }
}
