//! Role Resolution
//!
//! A role is the media kind a value is asked to act as. Every value plays its
//! own kind natively. Any other role needs a model that converts between the
//! two kinds, supplied through an explicitly constructed [`RoleResolver`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::generative::{Model, ModelInput};
use crate::core::media::{MediaAsset, MediaKind, MediaValue};
use crate::core::{CoreError, CoreResult, Options};

impl MediaValue {
    /// Roles this value satisfies without any conversion
    pub fn native_roles(&self) -> &'static [MediaKind] {
        match self {
            MediaValue::Text(_) => &[MediaKind::Text],
            MediaValue::Image(_) => &[MediaKind::Image],
            MediaValue::Audio(_) => &[MediaKind::Audio],
            MediaValue::Video(_) => &[MediaKind::Video],
        }
    }

    /// Whether [`MediaValue::as_role`] succeeds for `kind`. Pure and synchronous.
    pub fn can_play_role(&self, kind: MediaKind) -> bool {
        self.native_roles().contains(&kind)
    }

    /// Returns this value as `T` when it natively plays that role.
    ///
    /// The identity conversion is a clone: same id, same lineage.
    pub fn as_role<T: MediaAsset>(&self) -> CoreResult<T> {
        T::from_value(self.clone()).map_err(|value| CoreError::RoleNotSupported {
            from: value.kind(),
            to: T::KIND,
        })
    }
}

/// Conversion models keyed by `(from, to)` kind pairs
#[derive(Default, Clone)]
pub struct RoleResolver {
    conversions: HashMap<(MediaKind, MediaKind), Vec<Arc<dyn Model>>>,
}

impl std::fmt::Debug for RoleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut pairs: Vec<String> = self
            .conversions
            .iter()
            .map(|((from, to), models)| format!("{}->{} ({})", from, to, models.len()))
            .collect();
        pairs.sort();
        f.debug_struct("RoleResolver").field("conversions", &pairs).finish()
    }
}

impl RoleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model as a conversion from its input kind to its output kind
    pub fn register(&mut self, model: Arc<dyn Model>) {
        let key = (model.input_kind(), model.output_kind());
        self.conversions.entry(key).or_default().push(model);
    }

    pub fn with_model(mut self, model: Arc<dyn Model>) -> Self {
        self.register(model);
        self
    }

    /// Whether `value` can act as `kind`, natively or through a registered model
    pub fn can_play_role(&self, value: &MediaValue, kind: MediaKind) -> bool {
        value.can_play_role(kind) || self.conversions.contains_key(&(value.kind(), kind))
    }

    fn conversion(
        &self,
        from: MediaKind,
        to: MediaKind,
        model_id: Option<&str>,
    ) -> CoreResult<&Arc<dyn Model>> {
        let not_supported = CoreError::RoleNotSupported { from, to };
        let models = self.conversions.get(&(from, to)).ok_or(not_supported)?;

        match model_id {
            Some(id) => models.iter().find(|m| m.descriptor().id == id).ok_or_else(|| {
                CoreError::ModelNotFound {
                    provider_id: models
                        .first()
                        .map(|m| m.provider_id().to_string())
                        .unwrap_or_default(),
                    model_id: id.to_string(),
                }
            }),
            None => models
                .first()
                .ok_or(CoreError::RoleNotSupported { from, to }),
        }
    }

    /// Resolves `value` into a value of `kind`.
    ///
    /// Native roles are an identity clone. Otherwise the conversion model runs
    /// (the first registered one unless `model_id` names another) and its
    /// output carries a lineage step.
    pub async fn resolve_kind(
        &self,
        value: &MediaValue,
        kind: MediaKind,
        model_id: Option<&str>,
    ) -> CoreResult<MediaValue> {
        if value.can_play_role(kind) {
            return Ok(value.clone());
        }

        let model = self.conversion(value.kind(), kind, model_id)?;
        debug!(
            "Resolving {} as {} via {}/{}",
            value.kind(),
            kind,
            model.provider_id(),
            model.descriptor().id
        );
        model
            .transform(ModelInput::Value(value.clone()), &Options::new())
            .await
    }

    /// Typed form of [`RoleResolver::resolve_kind`]
    pub async fn as_role<T: MediaAsset>(
        &self,
        value: &MediaValue,
        model_id: Option<&str>,
    ) -> CoreResult<T> {
        let resolved = self.resolve_kind(value, T::KIND, model_id).await?;
        T::from_value(resolved).map_err(|other| CoreError::RoleNotSupported {
            from: other.kind(),
            to: T::KIND,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generative::mock::MockModel;
    use crate::core::generative::ProviderCapability;
    use crate::core::media::{Audio, AudioFormat, Image, ImageFormat, Text};

    #[test]
    fn test_identity_role_keeps_identity() {
        let value = MediaValue::from(Text::new("hello"));
        let text: Text = value.as_role().unwrap();

        assert_eq!(text.id(), value.id());
        assert!(text.is_valid());
        assert_eq!(text.into_value().lineage_depth(), 0);
    }

    #[test]
    fn test_bare_value_cannot_convert() {
        let value = MediaValue::from(Audio::new(vec![1, 2, 3], AudioFormat::Mp3));

        assert!(value.can_play_role(MediaKind::Audio));
        assert!(!value.can_play_role(MediaKind::Text));

        let err = value.as_role::<Image>().unwrap_err();
        assert!(matches!(
            err,
            CoreError::RoleNotSupported {
                from: MediaKind::Audio,
                to: MediaKind::Image
            }
        ));
    }

    #[tokio::test]
    async fn test_resolver_converts_with_lineage() {
        let transcriber = Arc::new(MockModel::new("whisper", ProviderCapability::AudioToText));
        let resolver = RoleResolver::new().with_model(transcriber.clone());
        let audio = MediaValue::from(Audio::new(vec![1, 2, 3], AudioFormat::Mp3));

        assert!(resolver.can_play_role(&audio, MediaKind::Text));
        assert!(!resolver.can_play_role(&audio, MediaKind::Video));

        let text: Text = resolver.as_role(&audio, None).await.unwrap();
        let value = text.into_value();
        assert_eq!(value.lineage_depth(), 1);
        assert_eq!(value.lineage().unwrap().input().id(), audio.id());
        assert_eq!(transcriber.call_count(), 1);
    }

    #[tokio::test]
    async fn test_resolver_identity_skips_models() {
        let model = Arc::new(MockModel::new("captioner", ProviderCapability::ImageToText));
        let resolver = RoleResolver::new().with_model(model.clone());
        let image = MediaValue::from(Image::new(vec![1], ImageFormat::Png));

        let same: Image = resolver.as_role(&image, None).await.unwrap();
        assert_eq!(same.id(), image.id());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resolver_unknown_model_id() {
        let resolver = RoleResolver::new().with_model(Arc::new(MockModel::new(
            "whisper",
            ProviderCapability::AudioToText,
        )));
        let audio = MediaValue::from(Audio::new(vec![1], AudioFormat::Mp3));

        let err = resolver
            .resolve_kind(&audio, MediaKind::Text, Some("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "model_not_found");

        let err = resolver
            .resolve_kind(&audio, MediaKind::Video, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "role_not_supported");
    }
}
