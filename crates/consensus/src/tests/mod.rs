pub mod support;

mod recovery;
