//! Taxonomía de errores del cliente.
//!
//! Sólo `Validation` y `Transport` abortan una operación visible para el
//! usuario. Los fallos de persistencia y de limpieza se degradan a avisos
//! dentro del informe de resultado (`workflow::OutcomeReport`).

use serde::Serialize;

/// Fallo al hablar con la API de análisis.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Error HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("La API respondió {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Respuesta no válida: {0}")]
    Parse(String),
    #[error("La operación se interrumpió: {0}")]
    Interrupted(String),
}

/// Fallo de una llamada al almacén remoto (base de datos u object storage).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Error HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("El almacén respondió {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Respuesta no válida: {0}")]
    Parse(String),
    #[error("La fila {0} todavía no es visible")]
    NotVisible(String),
}

/// Categoría de un error, tal y como se expone en los informes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transport,
    Persistence,
    Cleanup,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("Error en el análisis: {0}")]
    Transport(#[from] TransportError),
    #[error("Error de persistencia: {0}")]
    Persistence(StoreError),
    #[error("Error de limpieza: {0}")]
    Cleanup(StoreError),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Transport(_) => ErrorKind::Transport,
            AppError::Persistence(_) => ErrorKind::Persistence,
            AppError::Cleanup(_) => ErrorKind::Cleanup,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
