use sqlx::{QueryBuilder, Sqlite, Transaction};

use super::schema::Database;
use super::{FeedId, StoreError};
use crate::feed::ParsedArticle;

/// An article as stored.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredArticle {
    pub guid: String,
    pub title: String,
    pub url: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
}

/// Upserts articles for a feed inside `tx`, returning how many were new.
///
/// Two phases: `INSERT OR IGNORE` counts new rows via `changes()`, then an
/// `UPDATE` refreshes metadata of rows that already existed. `fetched_at`
/// keeps its first-seen value. Batches of 50 stay under SQLite's parameter
/// limit (7 columns * 50 = 350).
pub(crate) async fn upsert_articles(
    tx: &mut Transaction<'_, Sqlite>,
    feed_id: FeedId,
    articles: &[ParsedArticle],
) -> Result<usize, sqlx::Error> {
    if articles.is_empty() {
        return Ok(0);
    }

    const BATCH_SIZE: usize = 50;
    let now = chrono::Utc::now().timestamp();
    let mut total_inserted: usize = 0;

    for chunk in articles.chunks(BATCH_SIZE) {
        let mut insert_builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO articles (feed_id, guid, title, url, published, summary, fetched_at) ",
        );
        insert_builder.push_values(chunk, |mut b, article| {
            b.push_bind(feed_id.0)
                .push_bind(&article.guid)
                .push_bind(&article.title)
                .push_bind(&article.url)
                .push_bind(article.published)
                .push_bind(&article.summary)
                .push_bind(now);
        });
        insert_builder.build().execute(&mut **tx).await?;

        let changes: (i64,) = sqlx::query_as("SELECT changes()")
            .fetch_one(&mut **tx)
            .await?;
        total_inserted += usize::try_from(changes.0).unwrap_or(0);

        for article in chunk {
            sqlx::query(
                "UPDATE articles SET title = ?, url = ?, published = ?, summary = ? \
                 WHERE feed_id = ? AND guid = ?",
            )
            .bind(&article.title)
            .bind(&article.url)
            .bind(article.published)
            .bind(&article.summary)
            .bind(feed_id.0)
            .bind(&article.guid)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(total_inserted)
}

impl Database {
    /// Articles of one feed, newest first.
    pub async fn articles_for_feed(&self, feed_id: FeedId) -> Result<Vec<StoredArticle>, StoreError> {
        let articles = sqlx::query_as(
            "SELECT guid, title, url, published, summary FROM articles \
             WHERE feed_id = ? ORDER BY published DESC, id DESC",
        )
        .bind(feed_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    pub async fn article_count(&self, feed_id: FeedId) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = ?")
            .bind(feed_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
