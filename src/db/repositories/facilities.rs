use log::info;

use crate::{
    db::{documents::DocRef, Database},
    error::{Result, StudyError},
    models::Facility,
};

const FACILITIES: &str = "facilities";

impl Database {
    pub async fn create_facility(&self, facility: Facility) -> Result<()> {
        let facility_id = facility.facility_id.clone();
        self.transaction(move |tx| {
            let doc = DocRef::facility(&facility.facility_id);
            if tx.exists(&doc)? {
                return Err(StudyError::Config(format!(
                    "facility {} already exists",
                    facility.facility_id
                )));
            }
            tx.put(&doc, &facility)?;
            Ok(())
        })
        .await?;
        info!("Created facility {facility_id}");
        Ok(())
    }

    pub async fn get_facility(&self, facility_id: &str) -> Result<Option<Facility>> {
        self.get(DocRef::facility(facility_id)).await
    }

    pub async fn get_facility_by_slug(&self, slug: &str) -> Result<Option<Facility>> {
        let matches: Vec<Facility> = self.find_by(FACILITIES, "slug", slug).await?;
        Ok(matches.into_iter().next())
    }

    /// Ordered by display name.
    pub async fn list_facilities(&self) -> Result<Vec<Facility>> {
        let mut facilities: Vec<Facility> = self.list(FACILITIES).await?;
        facilities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(facilities)
    }

    pub async fn rename_facility(&self, facility_id: &str, name: String, slug: String) -> Result<()> {
        let id = facility_id.to_string();
        self.atomic_update(DocRef::facility(facility_id), move |facility: &mut Facility| {
            facility.name = name.clone();
            facility.slug = slug.clone();
            Ok(())
        })
        .await?
        .ok_or(StudyError::FacilityNotFound(id))
    }

    pub async fn add_facility_admin(&self, facility_id: &str, email: &str) -> Result<()> {
        let email = email.to_lowercase();
        let id = facility_id.to_string();
        self.atomic_update(DocRef::facility(facility_id), move |facility: &mut Facility| {
            if !facility.admins.contains(&email) {
                facility.admins.push(email.clone());
            }
            Ok(())
        })
        .await?
        .ok_or(StudyError::FacilityNotFound(id))
    }

    pub async fn remove_facility_admin(&self, facility_id: &str, email: &str) -> Result<()> {
        let email = email.to_lowercase();
        let id = facility_id.to_string();
        self.atomic_update(DocRef::facility(facility_id), move |facility: &mut Facility| {
            facility.admins.retain(|admin| admin != &email);
            Ok(())
        })
        .await?
        .ok_or(StudyError::FacilityNotFound(id))
    }

    pub async fn facilities_for_admin(&self, email: &str) -> Result<Vec<Facility>> {
        let email = email.to_lowercase();
        let facilities = self.list_facilities().await?;
        Ok(facilities
            .into_iter()
            .filter(|facility| facility.admins.iter().any(|admin| admin == &email))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admins_are_normalized_and_deduplicated() {
        let db = Database::open_in_memory().unwrap();
        db.create_facility(Facility::new("osaka", "Osaka", "osaka", "OSK"))
            .await
            .unwrap();
        db.add_facility_admin("osaka", "Admin@Example.org").await.unwrap();
        db.add_facility_admin("osaka", "admin@example.org").await.unwrap();

        let facility = db.get_facility("osaka").await.unwrap().unwrap();
        assert_eq!(facility.admins, vec!["admin@example.org".to_string()]);
        assert_eq!(db.facilities_for_admin("ADMIN@example.org").await.unwrap().len(), 1);

        db.remove_facility_admin("osaka", "admin@example.org").await.unwrap();
        assert!(db.facilities_for_admin("admin@example.org").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_and_missing_facilities() {
        let db = Database::open_in_memory().unwrap();
        db.create_facility(Facility::new("b", "Zeta", "zeta", "ZET")).await.unwrap();
        db.create_facility(Facility::new("a", "Alpha", "alpha", "ALP")).await.unwrap();
        assert!(matches!(
            db.create_facility(Facility::new("a", "Again", "again", "AGN")).await,
            Err(StudyError::Config(_))
        ));
        let names: Vec<String> = db
            .list_facilities()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
        assert_eq!(db.get_facility_by_slug("zeta").await.unwrap().unwrap().facility_id, "b");
        assert!(matches!(
            db.add_facility_admin("nope", "x@y.z").await,
            Err(StudyError::FacilityNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_keeps_numbering_and_moves_slug() {
        let db = Database::open_in_memory().unwrap();
        let mut facility = Facility::new("osaka", "Osaka", "osaka", "OSK");
        facility.next_reader_number = 4;
        db.create_facility(facility).await.unwrap();

        db.rename_facility("osaka", "Osaka University Hospital".into(), "ouh".into())
            .await
            .unwrap();
        assert_eq!(db.get_facility_by_slug("osaka").await.unwrap(), None);
        let renamed = db.get_facility_by_slug("ouh").await.unwrap().unwrap();
        assert_eq!(renamed.facility_id, "osaka");
        assert_eq!(renamed.name, "Osaka University Hospital");
        assert_eq!(renamed.next_reader_number, 4);

        assert!(matches!(
            db.rename_facility("kyoto", "Kyoto".into(), "kyoto".into()).await,
            Err(StudyError::FacilityNotFound(id)) if id == "kyoto"
        ));
        assert_eq!(db.get_facility("kyoto").await.unwrap(), None);
    }
}
