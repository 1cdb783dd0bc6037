use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use log::info;

use commissioner_api::{
    config::TemplateInfo,
    error::{CommissionError, PlatformFault, ReportError},
};

use crate::{
    engine::{placement::Placement, task::TaskPoller},
    platform::{Datacenter, PlatformClient, TemplateImportSpec},
};

/// A template VM ready to be cloned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateHandle {
    pub id: String,
    pub name: String,
}

/// Makes a template available in a datacenter, importing it when missing.
pub trait TemplateProvider: Send + Sync {
    fn get_or_upload_template(
        &self,
        platform: &dyn PlatformClient,
        poller: &TaskPoller<'_>,
        datacenter: &Datacenter,
        template: &TemplateInfo,
        placement: &Placement,
    ) -> Result<TemplateHandle, CommissionError>;
}

/// Looks the template up by name and imports it from its location when absent.
pub struct PlatformTemplateProvider;

impl TemplateProvider for PlatformTemplateProvider {
    fn get_or_upload_template(
        &self,
        platform: &dyn PlatformClient,
        poller: &TaskPoller<'_>,
        datacenter: &Datacenter,
        template: &TemplateInfo,
        placement: &Placement,
    ) -> Result<TemplateHandle, CommissionError> {
        let existing = platform
            .find_template(&datacenter.id, &template.name)
            .structured(PlatformFault::Query {
                kind: "template".into(),
                name: template.name.clone(),
            })?;
        if let Some(vm) = existing {
            return Ok(TemplateHandle {
                id: vm.id,
                name: vm.name,
            });
        }

        info!(
            "Importing template '{}' from '{}'",
            template.name, template.location
        );
        let task = platform
            .import_template(
                &datacenter.id,
                &TemplateImportSpec {
                    name: template.name.clone(),
                    location: template.location.clone(),
                    folder: datacenter.vm_folder.clone(),
                    host: placement.host.clone(),
                    datastore: placement.datastore.clone(),
                    resource_pool: placement.resource_pool.clone(),
                },
            )
            .structured(PlatformFault::Template {
                template: template.name.clone(),
            })?;
        let id = poller.await_object(
            &task,
            PlatformFault::Template {
                template: template.name.clone(),
            },
        )?;

        Ok(TemplateHandle {
            id,
            name: template.name.clone(),
        })
    }
}

/// Serializes template provisioning per template, so concurrent workers import a missing
/// template once.
pub struct TemplateCache {
    provider: Box<dyn TemplateProvider>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TemplateCache {
    pub fn new(provider: Box<dyn TemplateProvider>) -> Self {
        Self {
            provider,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: String) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    pub fn get(
        &self,
        platform: &dyn PlatformClient,
        poller: &TaskPoller<'_>,
        datacenter: &Datacenter,
        template: &TemplateInfo,
        placement: &Placement,
    ) -> Result<TemplateHandle, CommissionError> {
        let lock = self.lock_for(format!("{}/{}", datacenter.id, template.name));
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.provider
            .get_or_upload_template(platform, poller, datacenter, template, placement)
    }
}
