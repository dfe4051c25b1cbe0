/// Observer for reporting progress while folds are evaluated.
///
/// Folds may run on several threads at once, so callbacks take `&self`.
pub trait FoldObserver: Sync {
    fn on_start(&self, n_folds: usize) {
        let _ = n_folds;
    }
    fn on_fold_finished(&self, fold: usize) {
        let _ = fold;
    }
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopFoldObserver;

impl FoldObserver for NoopFoldObserver {}
