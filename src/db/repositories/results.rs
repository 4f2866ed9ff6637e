use crate::{
    db::{documents::DocRef, Database},
    error::Result,
    models::ReadingResult,
};

impl Database {
    /// Results of one session, ordered by their position in the case order.
    pub async fn session_results(&self, session_id: &str) -> Result<Vec<ReadingResult>> {
        let mut results: Vec<ReadingResult> =
            self.list(&DocRef::results_collection(session_id)).await?;
        results.sort_by_key(|result| result.case_order);
        Ok(results)
    }

    pub async fn get_reading_result(
        &self,
        session_id: &str,
        case_id: &str,
    ) -> Result<Option<ReadingResult>> {
        self.get(DocRef::result(session_id, case_id)).await
    }
}
