mod helpers;
mod tests_async;
mod tests_compaction;
mod tests_recovery;
