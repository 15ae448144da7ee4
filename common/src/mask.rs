use regex::Regex;

use crate::error::ValidationError;

/// Máscara sobre nombres de hosts o de jobs.
///
/// Es una expresión regular que tiene que matchear el identificador
/// completo (`lnx.*` acepta `lnx01` pero no `xlnx01`).
/// Un patrón vacío no restringe nada y se representa como `None`.
#[derive(Debug, Clone)]
pub struct Mask {
    re: Regex,
}

impl Mask {
    /// Compila un patrón. `Ok(None)` si el patrón está vacío.
    pub fn parse(pattern: &str) -> Result<Option<Mask>, regex::Error> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(None);
        }
        let re = Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(Some(Mask { re }))
    }

    /// Igual que [`Mask::parse`] pero reportando el campo del job que falló.
    pub fn parse_field(field: &'static str, pattern: &str) -> Result<Option<Mask>, ValidationError> {
        Mask::parse(pattern).map_err(|e| ValidationError::InvalidMask {
            field,
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.re.is_match(name)
    }
}

/// Filtro de hosts de un job (o de un bloque con override).
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    pub include: Option<Mask>,
    pub exclude: Option<Mask>,
}

impl HostFilter {
    pub fn compile(include: &str, exclude: &str) -> Result<HostFilter, ValidationError> {
        Ok(HostFilter {
            include: Mask::parse_field("hosts_mask", include)?,
            exclude: Mask::parse_field("hosts_mask_exclude", exclude)?,
        })
    }

    /// Devuelve el mismo filtro pero con la máscara de inclusión reemplazada
    /// (override a nivel de bloque). La exclusión del job se mantiene.
    pub fn with_include(&self, include: Option<Mask>) -> HostFilter {
        match include {
            Some(mask) => HostFilter {
                include: Some(mask),
                exclude: self.exclude.clone(),
            },
            None => self.clone(),
        }
    }

    pub fn admits(&self, host: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(host) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(host) {
                return false;
            }
        }
        true
    }
}
