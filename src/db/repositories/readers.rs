use crate::{
    db::{documents::DocRef, Database},
    error::{Result, StudyError},
    models::{ExperienceLevel, ReaderProfile},
};

const READERS: &str = "readers";

impl Database {
    /// Enabled profiles only.
    pub async fn get_reader_profile(&self, email: &str) -> Result<Option<ReaderProfile>> {
        let profile = self.get_reader_including_disabled(email).await?;
        Ok(profile.filter(|profile| !profile.disabled))
    }

    pub async fn get_reader_including_disabled(&self, email: &str) -> Result<Option<ReaderProfile>> {
        self.get(DocRef::reader(email)).await
    }

    pub async fn update_reader_level(&self, email: &str, level: ExperienceLevel) -> Result<()> {
        let missing = email.to_string();
        self.atomic_update(DocRef::reader(email), move |profile: &mut ReaderProfile| {
            profile.reader_level = level;
            Ok(())
        })
        .await?
        .ok_or(StudyError::ReaderNotFound(missing))
    }

    pub async fn update_display_name(&self, email: &str, display_name: String) -> Result<()> {
        let missing = email.to_string();
        self.atomic_update(DocRef::reader(email), move |profile: &mut ReaderProfile| {
            profile.display_name = Some(display_name.clone());
            Ok(())
        })
        .await?
        .ok_or(StudyError::ReaderNotFound(missing))
    }

    pub async fn readers_by_facility(&self, facility_id: &str) -> Result<Vec<ReaderProfile>> {
        let readers: Vec<ReaderProfile> = self.find_by(READERS, "facility_id", facility_id).await?;
        Ok(readers.into_iter().filter(|reader| !reader.disabled).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{ReaderRegistry, Registration};
    use crate::models::Facility;

    async fn registered() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_facility(Facility::new("osaka", "Osaka University", "osaka", "OSK"))
            .await
            .unwrap();
        ReaderRegistry::new(db.clone())
            .register(Registration {
                email: "a@example.org".into(),
                facility_id: "osaka".into(),
                reader_level: ExperienceLevel::General,
                display_name: None,
            })
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn profile_updates_change_only_their_field() {
        let db = registered().await;
        db.update_reader_level("a@example.org", ExperienceLevel::Specialist)
            .await
            .unwrap();
        db.update_display_name("a@example.org", "Dr. A".into())
            .await
            .unwrap();

        let profile = db.get_reader_profile("a@example.org").await.unwrap().unwrap();
        assert_eq!(profile.reader_level, ExperienceLevel::Specialist);
        assert_eq!(profile.display_name.as_deref(), Some("Dr. A"));
        assert_eq!(profile.reader_id, "OSK_001");
        assert_eq!(profile.facility_id, "osaka");
    }

    #[tokio::test]
    async fn updating_unknown_reader_is_not_found() {
        let db = registered().await;
        assert!(matches!(
            db.update_reader_level("nobody@example.org", ExperienceLevel::Specialist).await,
            Err(StudyError::ReaderNotFound(email)) if email == "nobody@example.org"
        ));
        assert!(matches!(
            db.update_display_name("nobody@example.org", "X".into()).await,
            Err(StudyError::ReaderNotFound(_))
        ));
        assert_eq!(db.get_reader_including_disabled("nobody@example.org").await.unwrap(), None);
    }
}
