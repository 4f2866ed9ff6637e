//! Facility-scoped reader identifiers and the reader registry built on them.
//!
//! Suffixes come from a recyclable pool: the smallest recycled number is
//! reused before `next_reader_number` grows. Every change to a facility's
//! pool happens inside one store transaction.

use log::{info, warn};

use crate::{
    db::{Database, DocRef, DocTransaction},
    error::{Result, StudyError},
    models::{ExperienceLevel, Facility, ReaderProfile, Session},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedId {
    pub reader_id: String,
    pub reader_number: u32,
}

/// Takes a suffix from `facility`, preferring recycled numbers.
fn take_number(facility: &mut Facility) -> Result<AllocatedId> {
    let reader_number = match facility.recycled_numbers.pop_first() {
        Some(number) => number,
        None => {
            let number = facility.next_reader_number;
            if facility.recycled_numbers.contains(&number) {
                return Err(StudyError::invariant(format!(
                    "facility {} would reissue pending recycled number {number}",
                    facility.facility_id
                )));
            }
            facility.next_reader_number = number.checked_add(1).ok_or_else(|| {
                StudyError::invariant(format!(
                    "facility {} reader number overflow",
                    facility.facility_id
                ))
            })?;
            number
        }
    };
    Ok(AllocatedId {
        reader_id: facility.reader_id(reader_number),
        reader_number,
    })
}

/// Returns `number` to the pool. Only numbers that were issued and are not
/// already pending may come back.
fn return_number(facility: &mut Facility, number: u32) -> Result<()> {
    if number == 0 || number >= facility.next_reader_number {
        return Err(StudyError::invariant(format!(
            "facility {} cannot recycle never-issued number {number}",
            facility.facility_id
        )));
    }
    if !facility.recycled_numbers.insert(number) {
        return Err(StudyError::invariant(format!(
            "facility {} number {number} recycled twice",
            facility.facility_id
        )));
    }
    Ok(())
}

/// Loads the facility and reports whether `number` has left `email`'s hands,
/// either back into the pool or to another reader.
fn number_released(
    tx: &DocTransaction<'_>,
    email: &str,
    facility_id: &str,
    number: u32,
) -> Result<(bool, Facility)> {
    let facility: Facility = tx
        .get(&DocRef::facility(facility_id))?
        .ok_or_else(|| StudyError::FacilityNotFound(facility_id.to_string()))?;
    if facility.recycled_numbers.contains(&number) {
        return Ok((true, facility));
    }
    let holders: Vec<ReaderProfile> = tx.find_by("readers", "facility_id", facility_id)?;
    let reissued = holders
        .iter()
        .any(|other| other.email != email && other.reader_number == number);
    Ok((reissued, facility))
}

#[derive(Clone)]
pub struct ReaderIdAllocator {
    db: Database,
}

impl ReaderIdAllocator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn allocate(&self, facility_id: &str) -> Result<AllocatedId> {
        let allocated = self
            .db
            .atomic_update(DocRef::facility(facility_id), take_number)
            .await?
            .ok_or_else(|| StudyError::FacilityNotFound(facility_id.to_string()))?;
        info!(
            "Issued reader id {} (facility {facility_id})",
            allocated.reader_id
        );
        Ok(allocated)
    }

    pub async fn recycle(&self, facility_id: &str, number: u32) -> Result<()> {
        self.db
            .atomic_update(DocRef::facility(facility_id), move |facility: &mut Facility| {
                return_number(facility, number)
            })
            .await?
            .ok_or_else(|| StudyError::FacilityNotFound(facility_id.to_string()))?;
        info!("Recycled reader number {number} (facility {facility_id})");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub facility_id: String,
    pub reader_level: ExperienceLevel,
    pub display_name: Option<String>,
}

/// Reader registration and removal.
#[derive(Clone)]
pub struct ReaderRegistry {
    db: Database,
    allocator: ReaderIdAllocator,
}

impl ReaderRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            allocator: ReaderIdAllocator::new(db.clone()),
            db,
        }
    }

    pub fn allocator(&self) -> &ReaderIdAllocator {
        &self.allocator
    }

    /// Issues an id and stores the profile. An email with any existing
    /// profile, disabled included, is refused.
    pub async fn register(&self, registration: Registration) -> Result<ReaderProfile> {
        let Registration {
            email,
            facility_id,
            reader_level,
            display_name,
        } = registration;

        if let Some(existing) = self.db.get_reader_including_disabled(&email).await? {
            return Err(if existing.disabled {
                StudyError::ReaderDisabled(email)
            } else {
                StudyError::ReaderAlreadyRegistered(email)
            });
        }

        let facility = self
            .db
            .get_facility(&facility_id)
            .await?
            .ok_or_else(|| StudyError::FacilityNotFound(facility_id.clone()))?;
        let allocated = self.allocator.allocate(&facility_id).await?;

        let profile = ReaderProfile {
            email: email.clone(),
            reader_id: allocated.reader_id,
            reader_number: allocated.reader_number,
            facility_id: facility.facility_id,
            facility_name: facility.name,
            reader_level,
            display_name,
            disabled: false,
        };

        // Claiming the email and writing the profile are one step so two
        // registrations racing on the same email cannot both succeed.
        let claimed = {
            let profile = profile.clone();
            self.db
                .transaction(move |tx| {
                    let doc = DocRef::reader(&profile.email);
                    if tx.exists(&doc)? {
                        return Ok(false);
                    }
                    tx.put(&doc, &profile)?;
                    Ok(true)
                })
                .await?
        };
        if !claimed {
            warn!("Concurrent registration for {email}; returning number {}", profile.reader_number);
            self.allocator
                .recycle(&profile.facility_id, profile.reader_number)
                .await?;
            return Err(StudyError::ReaderAlreadyRegistered(email));
        }

        info!("Registered reader {} as {}", email, profile.reader_id);
        Ok(profile)
    }

    /// Disables the reader, purges their study data, then returns their
    /// number to the facility. Each step can be repeated, so a failed call can
    /// simply be retried.
    pub async fn soft_delete(&self, email: &str) -> Result<()> {
        let profile = self
            .db
            .atomic_update(DocRef::reader(email), |profile: &mut ReaderProfile| {
                if profile.disabled {
                    info!("Reader {} already disabled; finishing removal", profile.email);
                }
                profile.disabled = true;
                Ok(profile.clone())
            })
            .await?
            .ok_or_else(|| StudyError::ReaderNotFound(email.to_string()))?;

        if self.number_is_released(&profile).await? {
            info!(
                "Reader {} ({}) already removed; number no longer held",
                email, profile.reader_id
            );
            return Ok(());
        }
        // The id must not be reissued while its sessions still exist.
        let purged = self.purge_sessions(&profile.reader_id).await?;
        let recycled = self.release_number(&profile).await?;
        info!(
            "Soft-deleted reader {} ({}); purged {purged} documents{}",
            email,
            profile.reader_id,
            if recycled { ", number recycled" } else { "" }
        );
        Ok(())
    }

    /// Whether the reader's number is pending reuse or held by someone else.
    async fn number_is_released(&self, profile: &ReaderProfile) -> Result<bool> {
        let email = profile.email.clone();
        let facility_id = profile.facility_id.clone();
        let number = profile.reader_number;
        self.db
            .transaction(move |tx| {
                let (released, _) = number_released(tx, &email, &facility_id, number)?;
                Ok(released)
            })
            .await
    }

    /// Recycles a disabled reader's number unless it is already pending or
    /// has since been issued to someone else.
    async fn release_number(&self, profile: &ReaderProfile) -> Result<bool> {
        let email = profile.email.clone();
        let facility_id = profile.facility_id.clone();
        let number = profile.reader_number;
        self.db
            .transaction(move |tx| {
                let current: ReaderProfile = tx
                    .get(&DocRef::reader(&email))?
                    .ok_or_else(|| StudyError::ReaderNotFound(email.clone()))?;
                if !current.disabled {
                    return Err(StudyError::invariant(format!(
                        "reader {email} re-enabled during removal"
                    )));
                }
                let (released, mut facility) = number_released(tx, &email, &facility_id, number)?;
                if released {
                    return Ok(false);
                }
                return_number(&mut facility, number)?;
                tx.put(&DocRef::facility(&facility_id), &facility)?;
                Ok(true)
            })
            .await
    }

    async fn purge_sessions(&self, reader_id: &str) -> Result<usize> {
        let sessions: Vec<Session> = self.db.sessions_by_reader(reader_id).await?;
        let docs = sessions
            .iter()
            .map(|session| DocRef::session(&session.session_id))
            .collect();
        let collections = sessions
            .iter()
            .map(|session| DocRef::results_collection(&session.session_id))
            .collect();
        self.db.delete_many(docs, collections).await
    }
}
