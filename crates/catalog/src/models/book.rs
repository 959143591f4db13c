use crate::book::{Book, BookHash};
use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BookRow {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) path: String,
    pub(crate) hash: Vec<u8>,
    pub(crate) uploaded_by: String,
    pub(crate) uploaded_at: i64,
}
impl From<&Book> for BookRow {
    fn from(book: &Book) -> Self {
        Self {
            id: book.id.hyphenated().to_string(),
            title: book.title.clone(),
            path: book.path.clone(),
            hash: book.hash.as_bytes().to_vec(),
            uploaded_by: book.owner.hyphenated().to_string(),
            uploaded_at: book.uploaded_at.unix_timestamp(),
        }
    }
}
impl TryFrom<BookRow> for Book {
    type Error = Error;
    fn try_from(row: BookRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id).or_raise(|| ErrorKind::InvalidData("book id"))?,
            title: row.title,
            path: row.path,
            hash: BookHash::try_from(row.hash.as_slice())?,
            owner: Uuid::parse_str(&row.uploaded_by).or_raise(|| ErrorKind::InvalidData("owner id"))?,
            uploaded_at: UtcDateTime::from_unix_timestamp(row.uploaded_at)
                .or_raise(|| ErrorKind::InvalidData("upload date"))?,
        })
    }
}
