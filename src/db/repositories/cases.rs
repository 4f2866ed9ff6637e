use log::info;

use crate::{
    db::{documents::DocRef, Database},
    error::Result,
    models::Case,
};

const CASES: &str = "cases";

impl Database {
    /// Writes the case pool. Re-seeding an existing id replaces it.
    pub async fn seed_cases(&self, cases: Vec<Case>) -> Result<usize> {
        let count = cases.len();
        self.transaction(move |tx| {
            for case in &cases {
                tx.put(&DocRef::case(&case.case_id), case)?;
            }
            Ok(())
        })
        .await?;
        info!("Seeded {count} cases");
        Ok(count)
    }

    /// Case ids ordered by `case_id`.
    pub async fn case_pool(&self) -> Result<Vec<String>> {
        let cases: Vec<Case> = self.list(CASES).await?;
        Ok(cases.into_iter().map(|case| case.case_id).collect())
    }

    pub async fn all_cases(&self) -> Result<Vec<Case>> {
        self.list(CASES).await
    }

    pub async fn case_basename(&self, case_id: &str) -> Result<Option<String>> {
        let case: Option<Case> = self.get(DocRef::case(case_id)).await?;
        Ok(case.map(|case| case.basename))
    }
}
