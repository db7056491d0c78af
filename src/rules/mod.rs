//! Word-boundary lexicons used to classify and rank conversation text

mod lexicon;

pub use lexicon::{Lexicon, LexiconConfig, LexiconSet};
