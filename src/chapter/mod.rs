// Chapter structures: the in-memory open chapter being filled, the
// immutable closed chapter written to the volume, and the index page map
// that routes a lookup to the right index page.

pub mod index;
pub mod index_page_map;
pub mod open_chapter;

pub use index::{
    close_chapter, fill_record_page, search_record_page, ChapterIndex, ClosedChapter,
};
pub use index_page_map::IndexPageMap;
pub use open_chapter::OpenChapter;
