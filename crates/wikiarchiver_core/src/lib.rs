pub mod archive;
pub mod changes;
pub mod checks;
pub mod citation;
pub mod config;
pub mod diff_content;
pub mod ledger;
pub mod pipeline;
pub mod rewrite;
pub mod wiki_api;

#[cfg(test)]
pub(crate) mod test_support;
